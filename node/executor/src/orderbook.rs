use agora_common::types::decimal;
use agora_common::{Order, OrderStatus};
use anyhow::{Context, Result};
use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

const CURSOR_KEY: &[u8] = b"meta:cursor";

/// Ledger event recorded against an order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    #[serde(with = "decimal")]
    pub order_id: U256,
    pub event: String,
    pub tx_hash: H256,
    pub block_number: u64,
    /// Unix milliseconds
    pub at: i64,
}

impl AuditEntry {
    pub fn new(order_id: U256, event: &str, tx_hash: H256, block_number: u64) -> Self {
        Self {
            order_id,
            event: event.to_string(),
            tx_hash,
            block_number,
            at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Persistent order state on sled.
///
/// Orders live under `order:<id>`, audit entries under `audit:<id>:<seq>`.
#[derive(Clone)]
pub struct OrderBook {
    db: Arc<sled::Db>,
}

fn order_key(order_id: U256) -> String {
    format!("order:{}", order_id)
}

impl OrderBook {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path).with_context(|| format!("opening order book at {}", path.display()))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Throwaway database removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn get(&self, order_id: U256) -> Result<Option<Order>> {
        match self.db.get(order_key(order_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert `order` unless one with the same id exists. Returns whether
    /// this call created it.
    pub fn insert_new(&self, order: &Order) -> Result<bool> {
        let value = serde_json::to_vec(order)?;
        let swapped = self
            .db
            .compare_and_swap(order_key(order.order_id), None as Option<&[u8]>, Some(value))?;
        Ok(swapped.is_ok())
    }

    /// Move an order to `next` when the lifecycle allows it, applying
    /// `update` to the stored record. Returns the new record, or `None` if
    /// the order is unknown or the transition is not allowed.
    pub fn transition<F>(&self, order_id: U256, next: OrderStatus, update: F) -> Result<Option<Order>>
    where
        F: Fn(&mut Order),
    {
        self.modify(order_id, |order| {
            if !order.status.can_transition_to(next) {
                return false;
            }
            order.status = next;
            update(order);
            true
        })
    }

    /// Record a stored result on a still-pending order so a failed
    /// settlement can be re-submitted without executing again
    pub fn record_result(&self, order_id: U256, locator: &str, result_hash: H256) -> Result<Option<Order>> {
        self.modify(order_id, |order| {
            if order.status != OrderStatus::Pending {
                return false;
            }
            order.result_locator = Some(locator.to_string());
            order.result_hash = Some(result_hash);
            true
        })
    }

    /// Compare-and-swap loop; `update` returns false to leave the record alone
    fn modify<F>(&self, order_id: U256, update: F) -> Result<Option<Order>>
    where
        F: Fn(&mut Order) -> bool,
    {
        let key = order_key(order_id);

        loop {
            let Some(current) = self.db.get(&key)? else {
                return Ok(None);
            };
            let mut order: Order = serde_json::from_slice(&current)?;
            if !update(&mut order) {
                return Ok(None);
            }

            let value = serde_json::to_vec(&order)?;
            if self
                .db
                .compare_and_swap(&key, Some(current), Some(value))?
                .is_ok()
            {
                return Ok(Some(order));
            }
        }
    }

    pub fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let seq = self.db.generate_id()?;
        let key = format!("audit:{}:{:020}", entry.order_id, seq);
        self.db.insert(key, serde_json::to_vec(entry)?)?;
        Ok(())
    }

    /// Audit entries of one order, oldest first
    pub fn audit_trail(&self, order_id: U256) -> Result<Vec<AuditEntry>> {
        self.db
            .scan_prefix(format!("audit:{}:", order_id))
            .map(|item| -> Result<AuditEntry> {
                let (_, value) = item?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    pub fn orders_with_status(&self, status: OrderStatus) -> Result<Vec<Order>> {
        let mut orders = Vec::new();
        for item in self.db.scan_prefix(b"order:") {
            let (_, value) = item?;
            let order: Order = serde_json::from_slice(&value)?;
            if order.status == status {
                orders.push(order);
            }
        }
        Ok(orders)
    }

    /// Last fully handled ledger block
    pub fn cursor(&self) -> Result<Option<u64>> {
        match self.db.get(CURSOR_KEY)? {
            Some(bytes) => {
                let raw = <[u8; 8]>::try_from(&bytes[..]).context("corrupt event cursor")?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    pub fn set_cursor(&self, block: u64) -> Result<()> {
        self.db.insert(CURSOR_KEY, block.to_be_bytes().to_vec())?;
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
