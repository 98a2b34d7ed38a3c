// ── Request correlation ──
//
// Assigns ids to outbound commands and matches response frames back to
// their waiters. Identical in-flight requests (same verb, binding and args)
// share one id and one response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::sync::oneshot;

use ctrlwire_api::{Command, CommandKind};

use crate::bindings::BindingKey;
use crate::error::RequestError;

pub type ReplyResult = Result<Value, RequestError>;

/// Response future handed to every waiter of a request.
pub type Reply = Shared<BoxFuture<'static, ReplyResult>>;

/// Outcome of [`Correlator::register`].
#[derive(Debug)]
pub enum Registration {
    /// A fresh request: the caller must transmit `command`.
    New { command: Command, reply: Reply },
    /// An identical request is already in flight.
    Joined { reply: Reply },
}

impl Registration {
    pub fn reply(&self) -> Reply {
        match self {
            Self::New { reply, .. } | Self::Joined { reply } => reply.clone(),
        }
    }
}

struct Pending {
    key: String,
    command: Command,
    tx: oneshot::Sender<ReplyResult>,
    created_at: DateTime<Utc>,
    /// Transport generation the command was last written on.
    sent_on: Option<u64>,
}

#[derive(Default)]
struct Table {
    by_key: HashMap<String, (u64, Reply)>,
    by_id: HashMap<u64, Pending>,
}

impl Table {
    fn take(&mut self, id: u64) -> Option<Pending> {
        let pending = self.by_id.remove(&id)?;
        self.by_key.remove(&pending.key);
        Some(pending)
    }
}

pub struct Correlator {
    next_id: AtomicU64,
    table: Mutex<Table>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: Mutex::new(Table::default()),
        }
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn dedup_key(kind: CommandKind, key: &BindingKey, args: Option<&Vec<Value>>) -> String {
    let args = args.map_or_else(String::new, |args| Value::from(args.clone()).to_string());
    format!("{kind}|{key}|{args}")
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request, or join the identical one already in flight.
    pub fn register(
        &self,
        kind: CommandKind,
        key: &BindingKey,
        args: Option<Vec<Value>>,
    ) -> Result<Registration, RequestError> {
        let dedup = dedup_key(kind, key, args.as_ref());
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some((id, reply)) = table.by_key.get(&dedup) {
            tracing::trace!(id, request = %dedup, "Joining in-flight request");
            return Ok(Registration::Joined {
                reply: reply.clone(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let command = Command {
            id,
            cmd: kind,
            sys: key.system.clone(),
            module: key.module.clone(),
            index: key.index,
            name: key.name.clone(),
            args,
        };
        // Fail before anything is recorded if the frame cannot be encoded.
        serde_json::to_string(&command).map_err(|e| RequestError::Encode(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let reply: Reply = async move { rx.await.unwrap_or(Err(RequestError::Dropped)) }
            .boxed()
            .shared();

        table.by_key.insert(dedup.clone(), (id, reply.clone()));
        table.by_id.insert(
            id,
            Pending {
                key: dedup,
                command: command.clone(),
                tx,
                created_at: Utc::now(),
                sent_on: None,
            },
        );
        Ok(Registration::New { command, reply })
    }

    /// Claim the write of request `id` on transport `generation`.
    ///
    /// Returns `false` when the request is no longer pending or has already
    /// been written on that generation, in which case nothing must be sent.
    pub fn claim_send(&self, id: u64, generation: u64) -> bool {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        match table.by_id.get_mut(&id) {
            Some(pending) if pending.sent_on != Some(generation) => {
                pending.sent_on = Some(generation);
                true
            }
            Some(_) => {
                tracing::trace!(id, generation, "Request already written on this transport");
                false
            }
            None => false,
        }
    }

    /// Complete request `id` with a success value.
    pub fn resolve(&self, id: u64, value: Value) -> bool {
        self.complete(id, Ok(value))
    }

    /// Complete request `id` with an error.
    pub fn reject(&self, id: u64, error: RequestError) -> bool {
        self.complete(id, Err(error))
    }

    fn complete(&self, id: u64, result: ReplyResult) -> bool {
        let pending = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take(id);
        match pending {
            Some(pending) => {
                let elapsed = Utc::now() - pending.created_at;
                tracing::trace!(
                    id,
                    cmd = %pending.command.cmd,
                    elapsed_ms = elapsed.num_milliseconds(),
                    ok = result.is_ok(),
                    "Request completed"
                );
                let _ = pending.tx.send(result);
                true
            }
            None => {
                tracing::trace!(id, "Response for unknown request id");
                false
            }
        }
    }

    /// Reject every pending request with `error`.
    pub fn fail_all(&self, error: &RequestError) {
        let drained: Vec<Pending> = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.by_key.clear();
            table.by_id.drain().map(|(_, pending)| pending).collect()
        };
        for pending in drained {
            let _ = pending.tx.send(Err(error.clone()));
        }
    }

    /// Commands still awaiting a response, oldest id first.
    pub fn pending_commands(&self) -> Vec<Command> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let mut commands: Vec<Command> = table
            .by_id
            .values()
            .map(|pending| pending.command.clone())
            .collect();
        commands.sort_by_key(|command| command.id);
        commands
    }

    pub fn pending_count(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .len()
    }
}
