use pubsub_core::event::Event;
use pubsub_macros::event;

#[event(event_type = "order.placed")]
struct OrderPlaced {
    order_id: u64,
    amount: i64,
}

#[event]
#[derive(PartialEq)]
#[serde(rename_all = "camelCase")]
struct Heartbeat {
    node_name: String,
}

fn main() {
    assert_eq!(OrderPlaced::EVENT_TYPE, "order.placed");
    assert!(OrderPlaced::lineage().is_empty());
    assert_eq!(Heartbeat::EVENT_TYPE, "Heartbeat");

    let placed = OrderPlaced {
        order_id: 1,
        amount: 42,
    };
    let copy = placed.clone();
    assert_eq!(format!("{copy:?}"), format!("{placed:?}"));

    let beat = Heartbeat {
        node_name: "a".into(),
    };
    assert_eq!(beat.clone(), beat);
}
