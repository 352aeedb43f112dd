use agora_common::contracts::{ServiceMarketplace, ServiceMarketplaceEvents};
use anyhow::{Context, Result};
use ethers::contract::LogMeta;
use ethers::providers::Middleware;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::ingestor::{EventOrigin, Liveness, OrderIngestor};
use crate::orderbook::OrderBook;

/// Largest block window requested in one log query
pub const MAX_BLOCK_RANGE: u64 = 2_000;

/// Polls the marketplace contract and feeds its events to the ingestor.
///
/// The cursor is persisted in the order book and only moves once every
/// event of a window has been handled.
pub struct LedgerEventSource<M> {
    marketplace: ServiceMarketplace<M>,
    ingestor: Arc<OrderIngestor>,
    book: OrderBook,
    poll_interval: Duration,
    start_block: Option<u64>,
}

impl<M: Middleware + 'static> LedgerEventSource<M> {
    pub fn new(
        marketplace: ServiceMarketplace<M>,
        ingestor: Arc<OrderIngestor>,
        book: OrderBook,
        poll_interval: Duration,
    ) -> Self {
        Self {
            marketplace,
            ingestor,
            book,
            poll_interval,
            start_block: None,
        }
    }

    /// First block to scan when no cursor is stored; defaults to the head
    pub fn with_start_block(mut self, block: u64) -> Self {
        self.start_block = Some(block);
        self
    }

    /// Ingest everything between the cursor and the chain head
    pub async fn poll_once(&self) -> Result<usize> {
        let latest = self
            .marketplace
            .client()
            .get_block_number()
            .await
            .context("fetching block number")?
            .as_u64();

        if self.ingestor.check_liveness(latest) == Liveness::Stalled {
            warn!("Chain head has not advanced past block {}", latest);
        }

        let mut from = match self.book.cursor()? {
            Some(cursor) => cursor + 1,
            None => self.start_block.unwrap_or(latest),
        };

        let mut handled = 0;
        while from <= latest {
            let to = latest.min(from + MAX_BLOCK_RANGE - 1);
            let mut events: Vec<(ServiceMarketplaceEvents, LogMeta)> = self
                .marketplace
                .events()
                .from_block(from)
                .to_block(to)
                .query_with_meta()
                .await
                .with_context(|| format!("querying events in blocks {}..={}", from, to))?;

            events.sort_by_key(|(_, meta)| (meta.block_number, meta.log_index));

            for (event, meta) in &events {
                self.ingestor.handle(event, EventOrigin::from(meta)).await?;
            }

            self.book.set_cursor(to)?;
            handled += events.len();
            from = to + 1;
        }

        Ok(handled)
    }

    pub async fn run(&self) {
        info!(
            "Watching marketplace {:?} every {:?}",
            self.marketplace.address(),
            self.poll_interval
        );

        loop {
            match self.poll_once().await {
                Ok(0) => {}
                Ok(n) => info!("Ingested {} marketplace events", n),
                Err(e) => error!("Event poll failed: {:#}", e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
