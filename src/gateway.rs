use tokio::sync::{mpsc, oneshot};

use crate::store::{Db, DbError};

/// What the gateway worker needs from a backing store. [`Db`] is the
/// production implementation.
pub trait Storage: Send + 'static {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, DbError>;
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DbError>;
}

impl Storage for Db {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, DbError> {
        Db::get(self, key)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        Db::put(self, key, value)
    }
}

enum Command {
    Get {
        key: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, DbError>>,
    },
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        reply: oneshot::Sender<Result<(), DbError>>,
    },
}

/// Serializes all access to a store behind one worker thread.
///
/// Callers enqueue a command carrying a private reply channel and block
/// on the answer. Commands run strictly in enqueue order with exactly one
/// in-flight store operation, so the store itself needs no locking and
/// compound index/file mutations never interleave.
///
/// Dropping the last handle closes the channel; the worker drains what is
/// queued, then drops the store, which flushes it. Calls racing that
/// shutdown get [`DbError::Closed`].
#[derive(Clone)]
pub struct SafeStore {
    commands: mpsc::Sender<Command>,
}

impl SafeStore {
    pub fn new<S: Storage>(mut storage: S) -> SafeStore {
        let (commands, mut receiver) = mpsc::channel::<Command>(1);
        std::thread::spawn(move || {
            while let Some(command) = receiver.blocking_recv() {
                match command {
                    Command::Get { key, reply } => {
                        let _ = reply.send(storage.get(&key));
                    }
                    Command::Put { key, value, reply } => {
                        let _ = reply.send(storage.put(&key, &value));
                    }
                }
            }
        });
        SafeStore { commands }
    }

    pub async fn get(&self, key: &[u8]) -> Result<Vec<u8>, DbError> {
        let (reply, answer) = oneshot::channel();
        let command = Command::Get {
            key: key.to_vec(),
            reply,
        };
        self.commands
            .send(command)
            .await
            .map_err(|_| DbError::Closed)?;
        answer.await.map_err(|_| DbError::Closed)?
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        let (reply, answer) = oneshot::channel();
        let command = Command::Put {
            key: key.to_vec(),
            value: value.to_vec(),
            reply,
        };
        self.commands
            .send(command)
            .await
            .map_err(|_| DbError::Closed)?;
        answer.await.map_err(|_| DbError::Closed)?
    }
}
