// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The refusing executor.

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::executor::{ExecutionResult, ExecutorCapabilities, OperationExecutor};
use crate::graph::Operation;
use async_trait::async_trait;
use std::collections::BTreeSet;

/// Claims no operations and refuses everything it is handed. Its presence in
/// the standard set guarantees that dispatch of an unclaimed operation ends
/// in an explicit `UnsupportedOperation` instead of silent success.
#[derive(Debug, Default)]
pub struct UnknownExecutor;

impl UnknownExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OperationExecutor for UnknownExecutor {
    fn name(&self) -> &str {
        "unknown"
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities {
            supported_operations: BTreeSet::new(),
            max_concurrency: 0,
            memory: 0,
            ..ExecutorCapabilities::default()
        }
    }

    fn can_execute(&self, _operation: &Operation) -> bool {
        false
    }

    async fn execute(
        &self,
        operation: &Operation,
        _context: &ExecutionContext,
    ) -> Result<ExecutionResult> {
        Err(Error::UnsupportedOperation(operation.describe()))
    }
}
