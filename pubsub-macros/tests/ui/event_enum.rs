use pubsub_core::event::Event;
use pubsub_macros::event;

#[event(event_type = "inventory")]
enum InventoryEvent {
    Reserved { sku: String, quantity: u32 },
    Released { sku: String },
}

fn main() {
    assert_eq!(InventoryEvent::EVENT_TYPE, "inventory");

    let reserved = InventoryEvent::Reserved {
        sku: "sku-1".into(),
        quantity: 2,
    };
    let json = serde_json::to_string(&reserved).unwrap();
    let back: InventoryEvent = serde_json::from_str(&json).unwrap();
    assert!(matches!(back, InventoryEvent::Reserved { quantity: 2, .. }));

    let _ = InventoryEvent::Released { sku: "x".into() };
}
