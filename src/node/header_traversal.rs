//! Stateful cursor over confirmed block headers.
//!
//! `next_headers` yields the next contiguous slice ending at most
//! `confirmation depth` blocks behind the provider's latest header. The
//! cursor advances only on a successful fetch, so a failed batch is simply
//! re-requested on the next call.

use std::sync::Arc;

use thiserror::Error;

use super::{EthClient, NodeError, RpcHeader};

#[derive(Debug, Error)]
pub enum TraversalError {
    /// The cursor sits above `latest - conf_depth`: the provider regressed.
    /// The caller must stop and alert rather than index a shrunken chain.
    #[error("the traversal cursor is ahead of the provider")]
    AheadOfProvider,
    #[error("unable to query headers: {0}")]
    Node(#[from] NodeError),
}

pub struct HeaderTraversal {
    client: Arc<dyn EthClient>,
    latest_header: Option<RpcHeader>,
    last_traversed_header: Option<RpcHeader>,
    conf_depth: u64,
}

impl HeaderTraversal {
    /// Cursor resuming after `from_header`, or from genesis when `None`.
    pub fn new(client: Arc<dyn EthClient>, from_header: Option<RpcHeader>, conf_depth: u64) -> Self {
        Self {
            client,
            latest_header: None,
            last_traversed_header: from_header,
            conf_depth,
        }
    }

    pub fn latest_header(&self) -> Option<&RpcHeader> {
        self.latest_header.as_ref()
    }

    pub fn last_traversed_header(&self) -> Option<&RpcHeader> {
        self.last_traversed_header.as_ref()
    }

    /// Next contiguous header slice of at most `max_size` headers, ending at
    /// most `conf_depth` behind the latest header. Empty when the cursor is
    /// idle at the confirmation boundary.
    pub async fn next_headers(&mut self, max_size: u64) -> Result<Vec<RpcHeader>, TraversalError> {
        let latest = self.client.block_header_by_number(None).await?;
        let latest_number = latest.number();
        self.latest_header = Some(latest);

        if latest_number < self.conf_depth {
            return Ok(Vec::new());
        }
        let end_height = latest_number - self.conf_depth;

        let next_height = match &self.last_traversed_header {
            Some(last) => {
                let last_number = last.number();
                if last_number == end_height {
                    return Ok(Vec::new());
                }
                if last_number > end_height {
                    return Err(TraversalError::AheadOfProvider);
                }
                last_number + 1
            }
            None => 0,
        };

        let end_height = clamp(next_height, end_height, max_size);
        let headers = self.client.block_headers_by_range(next_height, end_height).await?;
        if let Some(last) = headers.last() {
            self.last_traversed_header = Some(last.clone());
        }
        Ok(headers)
    }
}

/// Largest end height such that `start..=end` holds at most `size` items.
fn clamp(start: u64, end: u64, size: u64) -> u64 {
    if end - start + 1 <= size {
        end
    } else {
        start + size - 1
    }
}
