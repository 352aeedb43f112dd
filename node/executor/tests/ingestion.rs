use agora_common::contracts::{
    DisputeResolvedFilter, OrderCancelledFilter, OrderCompletedFilter, OrderCreatedFilter,
    OrderDisputedFilter, ServiceMarketplaceEvents,
};
use agora_common::{Order, OrderStatus};
use agora_executor::ingestor::{EventOrigin, Ingested, OrderIngestor};
use agora_executor::OrderBook;
use ethers::types::{Address, H256, U256};
use std::collections::HashMap;
use tokio::sync::mpsc;

const SERVICE: u64 = 1;

fn seller() -> Address {
    Address::repeat_byte(0x22)
}

fn origin(block: u64) -> EventOrigin {
    EventOrigin {
        tx_hash: H256::from_low_u64_be(block),
        block_number: block,
    }
}

fn created(order_id: u64) -> OrderCreatedFilter {
    OrderCreatedFilter {
        order_id: U256::from(order_id),
        service_id: U256::from(SERVICE),
        buyer: Address::repeat_byte(0x11),
        seller: seller(),
        total_price: U256::from(1_000_000_000_000_000u64),
        input_hash: [9u8; 32],
        deadline: 0,
    }
}

fn setup() -> (OrderBook, OrderIngestor, mpsc::Receiver<Order>) {
    let book = OrderBook::temporary().unwrap();
    let (tx, rx) = mpsc::channel(16);
    let services = HashMap::from([(U256::from(SERVICE), "sentiment-analysis".to_string())]);
    let ingestor = OrderIngestor::new(book.clone(), seller(), services, tx);
    (book, ingestor, rx)
}

#[tokio::test]
async fn redelivered_creation_is_a_no_op() {
    let (book, ingestor, mut rx) = setup();
    let event = ServiceMarketplaceEvents::OrderCreatedFilter(created(42));

    let first = ingestor.handle(&event, origin(100)).await.unwrap();
    let order = match first {
        Ingested::Created(order) => order,
        other => panic!("expected creation, got {:?}", other),
    };
    assert_eq!(order.service_type, "sentiment-analysis");
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.created_block, 100);
    assert_eq!(order.input_hash, H256::repeat_byte(9));

    let second = ingestor.handle(&event, origin(101)).await.unwrap();
    assert_eq!(second, Ingested::Duplicate);

    assert_eq!(rx.recv().await.unwrap().order_id, U256::from(42));
    assert!(rx.try_recv().is_err());

    let trail = book.audit_trail(U256::from(42)).unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].event, "created");
    assert_eq!(trail[0].block_number, 100);
    assert_eq!(book.get(U256::from(42)).unwrap().unwrap().created_block, 100);
}

#[tokio::test]
async fn foreign_and_unknown_orders_are_ignored() {
    let (book, ingestor, mut rx) = setup();

    let mut other_seller = created(1);
    other_seller.seller = Address::repeat_byte(0x99);
    assert_eq!(
        ingestor.handle_created(&other_seller, origin(5)).await.unwrap(),
        Ingested::Ignored
    );

    let mut unknown_service = created(2);
    unknown_service.service_id = U256::from(77);
    assert_eq!(
        ingestor.handle_created(&unknown_service, origin(5)).await.unwrap(),
        Ingested::Ignored
    );

    assert!(book.get(U256::from(1)).unwrap().is_none());
    assert!(book.get(U256::from(2)).unwrap().is_none());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn completion_records_locator_and_is_terminal() {
    let (book, ingestor, _rx) = setup();
    ingestor.handle_created(&created(7), origin(1)).await.unwrap();

    let completed = OrderCompletedFilter {
        order_id: U256::from(7),
        result_uri: "ipfs://f01551220ab".into(),
        result_hash: [3u8; 32],
    };
    let Ingested::Updated(order) = ingestor.handle_completed(&completed, origin(2)).unwrap() else {
        panic!("completion not applied");
    };
    assert_eq!(order.status, OrderStatus::Completed);
    assert_eq!(order.result_locator.as_deref(), Some("ipfs://f01551220ab"));
    assert_eq!(order.result_hash, Some(H256::repeat_byte(3)));

    let cancel = OrderCancelledFilter {
        order_id: U256::from(7),
    };
    assert_eq!(ingestor.handle_cancelled(&cancel, origin(3)).unwrap(), Ingested::Unchanged);
    assert_eq!(
        book.get(U256::from(7)).unwrap().unwrap().status,
        OrderStatus::Completed
    );
    assert_eq!(book.audit_trail(U256::from(7)).unwrap().len(), 2);
}

#[tokio::test]
async fn disputes_resolve_to_terminal_states() {
    let (book, ingestor, _rx) = setup();
    ingestor.handle_created(&created(8), origin(1)).await.unwrap();
    ingestor.handle_created(&created(9), origin(1)).await.unwrap();

    for id in [8u64, 9] {
        let disputed = OrderDisputedFilter {
            order_id: U256::from(id),
            reason: "late".into(),
        };
        assert!(matches!(
            ingestor.handle_disputed(&disputed, origin(2)).unwrap(),
            Ingested::Updated(_)
        ));
    }

    let refund = DisputeResolvedFilter {
        order_id: U256::from(8),
        refund_buyer: true,
    };
    let release = DisputeResolvedFilter {
        order_id: U256::from(9),
        refund_buyer: false,
    };
    ingestor.handle_resolved(&refund, origin(3)).unwrap();
    ingestor.handle_resolved(&release, origin(3)).unwrap();

    assert_eq!(book.get(U256::from(8)).unwrap().unwrap().status, OrderStatus::Cancelled);
    assert_eq!(book.get(U256::from(9)).unwrap().unwrap().status, OrderStatus::Completed);
}

#[tokio::test]
async fn events_for_untracked_orders_change_nothing() {
    let (book, ingestor, _rx) = setup();
    let cancel = OrderCancelledFilter {
        order_id: U256::from(500),
    };
    assert_eq!(ingestor.handle_cancelled(&cancel, origin(1)).unwrap(), Ingested::Ignored);
    assert!(book.audit_trail(U256::from(500)).unwrap().is_empty());
}

#[tokio::test]
async fn cancellation_of_a_pending_order_is_terminal() {
    let (book, ingestor, _rx) = setup();
    ingestor.handle_created(&created(11), origin(1)).await.unwrap();

    let cancel = ServiceMarketplaceEvents::OrderCancelledFilter(OrderCancelledFilter {
        order_id: U256::from(11),
    });
    let Ingested::Updated(order) = ingestor.handle(&cancel, origin(4)).await.unwrap() else {
        panic!("cancellation not applied");
    };
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert!(book.orders_with_status(OrderStatus::Pending).unwrap().is_empty());

    let trail = book.audit_trail(U256::from(11)).unwrap();
    assert_eq!(trail.len(), 2);
    assert_eq!(trail[1].event, "cancelled");
    assert_eq!(trail[1].block_number, 4);

    let completed = OrderCompletedFilter {
        order_id: U256::from(11),
        result_uri: "memory://1".into(),
        result_hash: [1u8; 32],
    };
    assert_eq!(ingestor.handle_completed(&completed, origin(5)).unwrap(), Ingested::Unchanged);
    assert_eq!(
        book.get(U256::from(11)).unwrap().unwrap().status,
        OrderStatus::Cancelled
    );
}
