//! Batched host calls applied as one unit.
//!
//! An [`Atomic`] queues API calls and commits them with a single
//! `nvim_call_atomic` request. The host runs them in order and stops at
//! the first failure, so a batch is never half-applied silently.
//!
//! # Example
//!
//! ```ignore
//! let mut atomic = Atomic::new();
//! atomic.command("highlight clear");
//! atomic.exec_lua("vim.g.loaded = ...", vec![Value::from(true)]);
//! atomic.commit_blocking(&ctx)?;
//! ```

use std::ops::Add;

use rmpv::Value;

use crate::error::{BridgeError, Result};
use crate::host::HostContext;

/// Prefix applied to every queued API name.
const API_PREFIX: &str = "nvim_";

/// Ordered queue of deferred host calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Atomic {
    instructions: Vec<(String, Vec<Value>)>,
    committed: bool,
}

impl Atomic {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `nvim_<api>` with `args`. Returns the instruction index.
    pub fn call(&mut self, api: &str, args: Vec<Value>) -> usize {
        self.instructions.push((format!("{}{}", API_PREFIX, api), args));
        self.instructions.len() - 1
    }

    /// Queue an Ex command.
    pub fn command(&mut self, cmd: &str) -> usize {
        self.call("command", vec![Value::from(cmd)])
    }

    /// Queue a Vimscript chunk.
    pub fn exec(&mut self, src: &str, output: bool) -> usize {
        let opts = Value::Map(vec![(Value::from("output"), Value::from(output))]);
        self.call("exec2", vec![Value::from(src), opts])
    }

    /// Queue a Lua chunk, called with `args` as `...`.
    pub fn exec_lua(&mut self, code: &str, args: Vec<Value>) -> usize {
        self.call("exec_lua", vec![Value::from(code), Value::Array(args)])
    }

    /// Append every instruction of `other`.
    pub fn extend(&mut self, other: Atomic) {
        self.instructions.extend(other.instructions);
    }

    /// Queued `(api, args)` pairs, in order.
    pub fn instructions(&self) -> &[(String, Vec<Value>)] {
        &self.instructions
    }

    /// Number of queued instructions.
    #[inline]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Check if nothing is queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Send the batch and return each instruction's result.
    pub async fn commit(&mut self, ctx: &HostContext) -> Result<Vec<Value>> {
        let Some(params) = self.prepare()? else {
            return Ok(Vec::new());
        };
        let reply = ctx.request("nvim_call_atomic", params).await?;
        self.unpack(reply)
    }

    /// Send the batch, blocking the current thread.
    pub fn commit_blocking(&mut self, ctx: &HostContext) -> Result<Vec<Value>> {
        let Some(params) = self.prepare()? else {
            return Ok(Vec::new());
        };
        let reply = ctx.request_blocking("nvim_call_atomic", params)?;
        self.unpack(reply)
    }

    fn prepare(&mut self) -> Result<Option<Vec<Value>>> {
        if self.committed {
            return Err(BridgeError::Protocol("atomic batch already committed".to_string()));
        }
        self.committed = true;
        if self.instructions.is_empty() {
            return Ok(None);
        }

        let calls = self
            .instructions
            .iter()
            .map(|(api, args)| Value::Array(vec![Value::from(api.as_str()), Value::Array(args.clone())]))
            .collect();
        tracing::trace!(count = self.instructions.len(), "committing atomic batch");
        Ok(Some(vec![Value::Array(calls)]))
    }

    /// Reply shape: `[results, error]`, error being nil or
    /// `[index, type, message]`.
    fn unpack(&self, reply: Value) -> Result<Vec<Value>> {
        let mut parts = match reply {
            Value::Array(parts) if parts.len() == 2 => parts,
            other => {
                return Err(BridgeError::Protocol(format!(
                    "unexpected nvim_call_atomic reply: {}",
                    other
                )))
            }
        };
        let error = parts.pop().unwrap_or(Value::Nil);
        let results = match parts.pop() {
            Some(Value::Array(results)) => results,
            _ => Vec::new(),
        };

        match error {
            Value::Nil => Ok(results),
            Value::Array(ref triple) if triple.len() == 3 => {
                let index = triple[0].as_u64().unwrap_or(0) as usize;
                let message = triple[2].as_str().unwrap_or_default();
                let api = self
                    .instructions
                    .get(index)
                    .map(|(api, _)| api.as_str())
                    .unwrap_or("?");
                Err(BridgeError::Host(format!(
                    "atomic instruction {} ({}) failed: {}",
                    index, api, message
                )))
            }
            other => Err(BridgeError::Host(other.to_string())),
        }
    }
}

impl Add for Atomic {
    type Output = Atomic;

    fn add(mut self, other: Atomic) -> Atomic {
        self.extend(other);
        self
    }
}
