use agora_common::contracts::{
    DisputeResolvedFilter, OrderCancelledFilter, OrderCompletedFilter, OrderCreatedFilter,
    OrderDisputedFilter, ServiceMarketplaceEvents,
};
use agora_common::{Order, OrderStatus};
use anyhow::{anyhow, Result};
use ethers::contract::LogMeta;
use ethers::types::{Address, H256, U256};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::orderbook::{AuditEntry, OrderBook};

/// Where a ledger event was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventOrigin {
    pub tx_hash: H256,
    pub block_number: u64,
}

impl From<&LogMeta> for EventOrigin {
    fn from(meta: &LogMeta) -> Self {
        Self {
            tx_hash: meta.transaction_hash,
            block_number: meta.block_number.as_u64(),
        }
    }
}

/// Effect of one event on local state
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// New pending order, already sent to the agent
    Created(Order),
    /// Order already known
    Duplicate,
    /// Not addressed to this agent or not tracked
    Ignored,
    Updated(Order),
    /// Known order whose status cannot take this event
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Advancing,
    Stalled,
}

/// Turns marketplace events into order state and work items.
///
/// Order creation is idempotent: a redelivered event finds the order
/// already stored and changes nothing.
pub struct OrderIngestor {
    book: OrderBook,
    seller: Address,
    services: HashMap<U256, String>,
    work: mpsc::Sender<Order>,
    last_height: Mutex<Option<u64>>,
}

impl OrderIngestor {
    /// `services` maps this agent's listed service ids to service types
    pub fn new(
        book: OrderBook,
        seller: Address,
        services: HashMap<U256, String>,
        work: mpsc::Sender<Order>,
    ) -> Self {
        Self {
            book,
            seller,
            services,
            work,
            last_height: Mutex::new(None),
        }
    }

    pub async fn handle(&self, event: &ServiceMarketplaceEvents, origin: EventOrigin) -> Result<Ingested> {
        match event {
            ServiceMarketplaceEvents::OrderCreatedFilter(e) => self.handle_created(e, origin).await,
            ServiceMarketplaceEvents::OrderCompletedFilter(e) => self.handle_completed(e, origin),
            ServiceMarketplaceEvents::OrderCancelledFilter(e) => self.handle_cancelled(e, origin),
            ServiceMarketplaceEvents::OrderDisputedFilter(e) => self.handle_disputed(e, origin),
            ServiceMarketplaceEvents::DisputeResolvedFilter(e) => self.handle_resolved(e, origin),
            other => {
                debug!("Skipping marketplace event {:?}", other);
                Ok(Ingested::Ignored)
            }
        }
    }

    pub async fn handle_created(&self, event: &OrderCreatedFilter, origin: EventOrigin) -> Result<Ingested> {
        if self.book.get(event.order_id)?.is_some() {
            debug!("Order {} already known", event.order_id);
            return Ok(Ingested::Duplicate);
        }

        if event.seller != self.seller {
            debug!("Order {} is for seller {:?}", event.order_id, event.seller);
            return Ok(Ingested::Ignored);
        }

        let Some(service_type) = self.services.get(&event.service_id) else {
            warn!(
                "Order {} references service {} which this agent does not offer",
                event.order_id, event.service_id
            );
            return Ok(Ingested::Ignored);
        };

        let order = Order {
            order_id: event.order_id,
            service_id: event.service_id,
            service_type: service_type.clone(),
            buyer: event.buyer,
            seller: event.seller,
            total_price: event.total_price,
            input_hash: H256::from(event.input_hash),
            deadline: event.deadline,
            status: OrderStatus::Pending,
            created_tx: origin.tx_hash,
            created_block: origin.block_number,
            result_locator: None,
            result_hash: None,
        };

        if !self.book.insert_new(&order)? {
            return Ok(Ingested::Duplicate);
        }
        self.audit(order.order_id, "created", origin)?;

        info!(
            "New order {} for {} ({} wei) in tx {:?}",
            order.order_id, order.service_type, order.total_price, origin.tx_hash
        );

        self.work
            .send(order.clone())
            .await
            .map_err(|_| anyhow!("agent stopped accepting work"))?;

        Ok(Ingested::Created(order))
    }

    pub fn handle_completed(&self, event: &OrderCompletedFilter, origin: EventOrigin) -> Result<Ingested> {
        let locator = event.result_uri.clone();
        let hash = H256::from(event.result_hash);
        self.apply(event.order_id, OrderStatus::Completed, "completed", origin, move |o| {
            o.result_locator = Some(locator.clone());
            o.result_hash = Some(hash);
        })
    }

    pub fn handle_cancelled(&self, event: &OrderCancelledFilter, origin: EventOrigin) -> Result<Ingested> {
        self.apply(event.order_id, OrderStatus::Cancelled, "cancelled", origin, |_| {})
    }

    pub fn handle_disputed(&self, event: &OrderDisputedFilter, origin: EventOrigin) -> Result<Ingested> {
        if self.book.get(event.order_id)?.is_some() {
            warn!("Order {} disputed: {}", event.order_id, event.reason);
        }
        self.apply(event.order_id, OrderStatus::Disputed, "disputed", origin, |_| {})
    }

    pub fn handle_resolved(&self, event: &DisputeResolvedFilter, origin: EventOrigin) -> Result<Ingested> {
        let next = if event.refund_buyer {
            OrderStatus::Cancelled
        } else {
            OrderStatus::Completed
        };
        self.apply(event.order_id, next, "dispute-resolved", origin, |_| {})
    }

    fn apply<F>(
        &self,
        order_id: U256,
        next: OrderStatus,
        label: &str,
        origin: EventOrigin,
        update: F,
    ) -> Result<Ingested>
    where
        F: Fn(&mut Order),
    {
        if self.book.get(order_id)?.is_none() {
            return Ok(Ingested::Ignored);
        }

        match self.book.transition(order_id, next, update)? {
            Some(order) => {
                self.audit(order_id, label, origin)?;
                info!("Order {} is now {}", order_id, order.status);
                Ok(Ingested::Updated(order))
            }
            None => {
                debug!("Order {} cannot move to {}", order_id, next);
                Ok(Ingested::Unchanged)
            }
        }
    }

    fn audit(&self, order_id: U256, event: &str, origin: EventOrigin) -> Result<()> {
        self.book.append_audit(&AuditEntry::new(
            order_id,
            event,
            origin.tx_hash,
            origin.block_number,
        ))
    }

    /// Compare `height` with the previous observation
    pub fn check_liveness(&self, height: u64) -> Liveness {
        let mut last = self.last_height.lock().unwrap_or_else(|e| e.into_inner());
        let liveness = match *last {
            Some(previous) if height <= previous => Liveness::Stalled,
            _ => Liveness::Advancing,
        };
        *last = Some(height);
        liveness
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_tracks_height() {
        let (tx, _rx) = mpsc::channel(1);
        let ingestor = OrderIngestor::new(
            OrderBook::temporary().unwrap(),
            Address::zero(),
            HashMap::new(),
            tx,
        );
        assert_eq!(ingestor.check_liveness(10), Liveness::Advancing);
        assert_eq!(ingestor.check_liveness(10), Liveness::Stalled);
        assert_eq!(ingestor.check_liveness(12), Liveness::Advancing);
    }
}
