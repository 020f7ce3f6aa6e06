//! Membership lifecycle over the public registry API: subscribe and
//! unsubscribe commands must track member-count transitions exactly.

use notify_gateway::pubsub::PubSubCommand;
use notify_gateway::registry::{ConnectionId, MembershipRegistry};
use notify_gateway::routing::routing_key;
use tokio::sync::mpsc;

fn setup() -> (MembershipRegistry, mpsc::Receiver<PubSubCommand>) {
    let (tx, rx) = mpsc::channel(1024);
    (MembershipRegistry::new(tx), rx)
}

fn drain(rx: &mut mpsc::Receiver<PubSubCommand>) -> Vec<PubSubCommand> {
    let mut out = Vec::new();
    while let Ok(cmd) = rx.try_recv() {
        out.push(cmd);
    }
    out
}

#[test]
fn one_subscription_spans_a_users_tabs() {
    let (registry, mut rx) = setup();
    let key = routing_key("u1");

    let tab1 = ConnectionId::new_v4();
    let tab2 = ConnectionId::new_v4();
    assert!(registry.join(tab1, key.clone()).unwrap());
    assert!(!registry.join(tab2, key.clone()).unwrap());

    // Closing one tab keeps the subscription; closing the last drops it.
    assert!(!registry.leave(tab1).unwrap().unsubscribed_now);
    assert!(registry.leave(tab2).unwrap().unsubscribed_now);

    assert_eq!(
        drain(&mut rx),
        vec![
            PubSubCommand::Subscribe(key.clone()),
            PubSubCommand::Unsubscribe(key),
        ]
    );
}

#[test]
fn distinct_users_hold_independent_subscriptions() {
    let (registry, mut rx) = setup();

    let c1 = ConnectionId::new_v4();
    let c2 = ConnectionId::new_v4();
    assert!(registry.join(c1, routing_key("u1")).unwrap());
    assert!(registry.join(c2, routing_key("u2")).unwrap());

    assert_eq!(registry.members_of(&routing_key("u1")), vec![c1]);
    assert_eq!(registry.members_of(&routing_key("u2")), vec![c2]);

    // Dropping u1 must not disturb u2's subscription.
    assert!(registry.leave(c1).unwrap().unsubscribed_now);
    let mut keys = registry.active_keys();
    keys.sort();
    assert_eq!(keys, vec![routing_key("u2")]);

    let commands = drain(&mut rx);
    assert_eq!(commands.len(), 3);
    assert_eq!(
        commands[2],
        PubSubCommand::Unsubscribe(routing_key("u1"))
    );
}

#[test]
fn rejoin_after_disconnect_starts_a_fresh_subscription() {
    let (registry, mut rx) = setup();
    let key = routing_key("u1");

    let old = ConnectionId::new_v4();
    registry.join(old, key.clone()).unwrap();
    registry.leave(old).unwrap();

    // While nobody is connected the room is empty and no key is held.
    assert!(registry.members_of(&key).is_empty());
    assert!(registry.active_keys().is_empty());

    let fresh = ConnectionId::new_v4();
    assert!(registry.join(fresh, key.clone()).unwrap());
    assert_eq!(registry.members_of(&key), vec![fresh]);

    assert_eq!(
        drain(&mut rx),
        vec![
            PubSubCommand::Subscribe(key.clone()),
            PubSubCommand::Unsubscribe(key.clone()),
            PubSubCommand::Subscribe(key),
        ]
    );
}

#[test]
fn disconnect_for_a_never_joined_connection_changes_nothing() {
    let (registry, mut rx) = setup();
    let member = ConnectionId::new_v4();
    registry.join(member, routing_key("u1")).unwrap();

    assert!(registry.leave(ConnectionId::new_v4()).is_none());

    assert_eq!(registry.members_of(&routing_key("u1")), vec![member]);
    assert_eq!(
        drain(&mut rx),
        vec![PubSubCommand::Subscribe(routing_key("u1"))]
    );
}
