use pubsub_core::event::Event;
use pubsub_macros::event;

#[event(event_type = "domain")]
struct DomainEvent {
    id: String,
}

#[event(event_type = "order", extends = DomainEvent)]
struct OrderEvent {
    id: String,
}

#[event(event_type = "order.cancelled", extends = OrderEvent)]
struct OrderCancelled {
    id: String,
    reason: String,
}

#[event(event_type = "audit")]
struct AuditEvent;

fn main() {
    assert_eq!(OrderCancelled::lineage(), vec!["order", "domain"]);
    assert!(OrderCancelled::is_subtype_of::<OrderEvent>());
    assert!(OrderCancelled::is_subtype_of::<DomainEvent>());
    assert!(OrderCancelled::is_subtype_of::<OrderCancelled>());
    assert!(!OrderCancelled::is_subtype_of::<AuditEvent>());
    assert!(!DomainEvent::is_subtype_of::<OrderEvent>());
}
