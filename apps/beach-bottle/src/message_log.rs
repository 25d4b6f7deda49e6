//! Block-chunked, append-only history of the messages exchanged with one peer.
//!
//! Layout under the local root:
//!
//! ```text
//! <peer>/messages/block.json          current block pointer {index, messages}
//! <peer>/messages/block-<N>.json      completed block N (exactly block_size messages)
//! <peer>/messages/block-<N>/<i>.json  message i of the in-progress block N
//! ```
//!
//! A message is durable once its own document is written. Completing a block
//! writes `block-<N>.json`, then advances the pointer, then removes the
//! per-message documents.

use std::sync::Arc;

use bottle_storage::{PeerAddress, StorageClient, StorageError, StoragePath, read_json, write_json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const DEFAULT_BLOCK_SIZE: usize = 10;

const POINTER_DOCUMENT: &str = "block.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub block: u64,
    pub index: u64,
    pub sender: Sender,
    pub body: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBlock {
    pub index: u64,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl MessageBlock {
    fn empty(index: u64) -> Self {
        Self {
            index,
            messages: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to initialize message log for {peer}: {source}")]
    Initialization {
        peer: PeerAddress,
        source: Box<LogError>,
    },
    #[error("block size must be at least 1")]
    InvalidBlockSize,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("corrupt message log: {0}")]
    Corrupt(String),
    #[error("completed block {0} is missing")]
    MissingBlock(u64),
}

pub struct MessageLog {
    storage: Arc<dyn StorageClient>,
    base: StoragePath,
    block_size: usize,
    current: MessageBlock,
}

impl MessageLog {
    /// Loads the current block for `peer`, creating block 0 on first use.
    ///
    /// A failed read is fatal and never falls through to a create, so an
    /// unreachable medium cannot clobber existing history.
    pub async fn initialize(
        storage: Arc<dyn StorageClient>,
        peer: &PeerAddress,
        block_size: usize,
    ) -> Result<Self, LogError> {
        if block_size == 0 {
            return Err(LogError::InvalidBlockSize);
        }
        let base = log_base(storage.as_ref(), peer);
        let current = Self::load_or_create(storage.as_ref(), &base, block_size)
            .await
            .map_err(|source| LogError::Initialization {
                peer: peer.clone(),
                source: Box::new(source),
            })?;
        info!(
            target = "beach_bottle::message_log",
            peer = %peer,
            block = current.index,
            pending = current.messages.len(),
            "message log ready"
        );
        Ok(Self {
            storage,
            base,
            block_size,
            current,
        })
    }

    /// Opens the log for `peer` without writing anything. Returns `None`
    /// when no conversation with `peer` has been recorded.
    pub async fn open_existing(
        storage: Arc<dyn StorageClient>,
        peer: &PeerAddress,
        block_size: usize,
    ) -> Result<Option<Self>, LogError> {
        if block_size == 0 {
            return Err(LogError::InvalidBlockSize);
        }
        let base = log_base(storage.as_ref(), peer);
        let Some(current) = Self::load_current(storage.as_ref(), &base, block_size).await? else {
            return Ok(None);
        };
        Ok(Some(Self {
            storage,
            base,
            block_size,
            current,
        }))
    }

    async fn load_or_create(
        storage: &dyn StorageClient,
        base: &StoragePath,
        block_size: usize,
    ) -> Result<MessageBlock, LogError> {
        if let Some(block) = Self::load_current(storage, base, block_size).await? {
            return Ok(block);
        }
        let pointer = base.join(POINTER_DOCUMENT);
        let block = MessageBlock::empty(0);
        write_json(storage, &pointer, &block).await?;
        debug!(target = "beach_bottle::message_log", path = %pointer, "created block 0");
        Ok(block)
    }

    async fn load_current(
        storage: &dyn StorageClient,
        base: &StoragePath,
        block_size: usize,
    ) -> Result<Option<MessageBlock>, LogError> {
        let pointer = base.join(POINTER_DOCUMENT);
        let Some(mut block) = read_json::<MessageBlock>(storage, &pointer).await? else {
            return Ok(None);
        };
        if block.messages.is_empty() {
            block.messages = Self::load_pending(storage, base, block.index, block_size).await?;
        }
        if block.messages.len() > block_size {
            return Err(LogError::Corrupt(format!(
                "block {} holds {} messages, more than {block_size}",
                block.index,
                block.messages.len()
            )));
        }
        Ok(Some(block))
    }

    /// Per-message documents of block `index`, stopping at the first gap.
    async fn load_pending(
        storage: &dyn StorageClient,
        base: &StoragePath,
        index: u64,
        block_size: usize,
    ) -> Result<Vec<Message>, LogError> {
        let mut messages = Vec::new();
        for seq in 0..block_size as u64 {
            let path = message_path(base, index, seq);
            let Some(message) = read_json::<Message>(storage, &path).await? else {
                break;
            };
            if message.block != index || message.index != seq {
                return Err(LogError::Corrupt(format!(
                    "{path} holds message {}:{}",
                    message.block, message.index
                )));
            }
            messages.push(message);
        }
        Ok(messages)
    }

    pub fn current_block(&self) -> u64 {
        self.current.index
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Messages of the in-progress block.
    pub fn recent(&self) -> &[Message] {
        &self.current.messages
    }

    /// Persists a new message and returns it with its assigned position.
    /// On error the log is unchanged.
    pub async fn append(&mut self, sender: Sender, body: Value) -> Result<Message, LogError> {
        if self.current.messages.len() >= self.block_size {
            self.complete_current().await?;
        }
        let message = Message {
            block: self.current.index,
            index: self.current.messages.len() as u64,
            sender,
            body,
            sent_at: OffsetDateTime::now_utc(),
        };
        let path = message_path(&self.base, message.block, message.index);
        write_json(self.storage.as_ref(), &path, &message).await?;
        self.current.messages.push(message.clone());

        if self.current.messages.len() >= self.block_size {
            if let Err(err) = self.complete_current().await {
                warn!(
                    target = "beach_bottle::message_log",
                    block = self.current.index,
                    error = %err,
                    "block completion deferred to next append"
                );
            }
        }
        Ok(message)
    }

    async fn complete_current(&mut self) -> Result<(), LogError> {
        let index = self.current.index;
        write_json(self.storage.as_ref(), &self.block_path(index), &self.current).await?;
        let next = MessageBlock::empty(index + 1);
        write_json(
            self.storage.as_ref(),
            &self.base.join(POINTER_DOCUMENT),
            &next,
        )
        .await?;
        let finished = std::mem::replace(&mut self.current, next);
        for message in &finished.messages {
            let path = message_path(&self.base, index, message.index);
            if let Err(err) = self.storage.delete(&path).await {
                debug!(
                    target = "beach_bottle::message_log",
                    path = %path,
                    error = %err,
                    "failed to remove superseded message document"
                );
            }
        }
        info!(
            target = "beach_bottle::message_log",
            block = index,
            messages = finished.messages.len(),
            "block completed"
        );
        Ok(())
    }

    /// Full history in append order. Completed blocks are read from storage
    /// on every call.
    pub async fn replay_all(&self) -> Result<Vec<Message>, LogError> {
        let mut messages = Vec::new();
        for index in 0..self.current.index {
            let block = read_json::<MessageBlock>(self.storage.as_ref(), &self.block_path(index))
                .await?
                .ok_or(LogError::MissingBlock(index))?;
            messages.extend(block.messages);
        }
        messages.extend(self.current.messages.iter().cloned());
        Ok(messages)
    }

    fn block_path(&self, index: u64) -> StoragePath {
        self.base.join(format!("block-{index}.json"))
    }
}

fn log_base(storage: &dyn StorageClient, peer: &PeerAddress) -> StoragePath {
    StoragePath::new(storage.self_address().clone(), [peer.as_str(), "messages"])
}

fn message_path(base: &StoragePath, block: u64, seq: u64) -> StoragePath {
    base.join(format!("block-{block}")).join(format!("{seq}.json"))
}
