use deaddrop::crypto::{derive_conversation_key, derive_user_id};
use deaddrop::protocol::{open_envelope, seal_message, Message, MessageKind};

#[test]
fn independently_derived_keys_exchange_a_message() {
    // Each side derives from its own view of the pair; no key crosses the wire.
    let alice = derive_user_id("alice", "between-us");
    let bob = derive_user_id("bob", "between-us");
    let alice_key = derive_conversation_key("between-us", &alice, &bob);
    let bob_key = derive_conversation_key("between-us", &bob, &alice);

    let message = Message::new(&alice, &bob, MessageKind::Text, "hello bob", 1_700_000_000_000);
    let envelope = seal_message(&alice_key, &message).expect("seal");
    let opened = open_envelope(&bob_key, &envelope).expect("open");

    assert_eq!(opened.id, message.id);
    assert_eq!(opened.body, "hello bob");
    assert_eq!(opened.sender_id, alice);
}

#[test]
fn wrong_secret_cannot_open_the_envelope() {
    let alice = derive_user_id("alice", "between-us");
    let bob = derive_user_id("bob", "between-us");
    let key = derive_conversation_key("between-us", &alice, &bob);
    let eavesdropper = derive_conversation_key("guessed-wrong", &alice, &bob);

    let message = Message::new(&alice, &bob, MessageKind::Text, "private", 1_700_000_000_000);
    let envelope = seal_message(&key, &message).expect("seal");

    assert!(open_envelope(&eavesdropper, &envelope).is_err());
}
