use std::env;
use std::error::Error;
use std::path::PathBuf;

use deaddrop::crypto::{derive_conversation_key, derive_user_id};
use deaddrop::protocol::{
    now_millis, open_envelope, seal_message, DeliveryStatus, Message, MessageKind,
};
use deaddrop::relay_transport::{fetch_sync, post_ack, post_enqueue, post_register};
use deaddrop::storage::ClientStore;

const KV_IDENTITY_ID: &str = "identity_id";
const KV_IDENTITY_SECRET: &str = "identity_secret";

fn main() {
    deaddrop::logging::init();
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let mut args = env::args().collect::<Vec<String>>();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let command = args[1].clone();
    let command_args = args.split_off(2);

    match command.as_str() {
        "init" => init_identity(&command_args),
        "link" => link_peer(&command_args),
        "send" => send_message(&command_args),
        "sync" => sync_messages(&command_args),
        "feed" => show_feed(),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!(
        "deaddrop commands:\n\
         \n\
         init <name> <shared_secret> [--relay <url>]\n\
         link <peer_id>\n\
         send <message> [--relay <url>]\n\
         sync [--relay <url>] [--wait]\n\
         feed\n\
         \n\
         Environment:\n\
         DEADDROP_HOME defaults to .deaddrop\n\
         DEADDROP_RELAY_URL provides a relay URL default for init/send/sync"
    );
}

fn data_dir() -> PathBuf {
    env::var("DEADDROP_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".deaddrop"))
}

fn open_store() -> Result<ClientStore, Box<dyn Error>> {
    Ok(ClientStore::open(&data_dir().join("client.db"))?)
}

struct Identity {
    id: String,
    secret: String,
}

fn load_identity(store: &ClientStore) -> Result<Identity, Box<dyn Error>> {
    let id = store
        .get_value(KV_IDENTITY_ID)?
        .ok_or("no identity; run init first")?;
    let secret = store
        .get_value(KV_IDENTITY_SECRET)?
        .ok_or("identity is missing its secret; run init again")?;
    Ok(Identity { id, secret })
}

/// Pull a `--relay <url>` flag out of `args`, leaving the rest in place.
fn split_relay_flag(args: &[String]) -> Result<(Option<String>, Vec<String>), Box<dyn Error>> {
    let mut relay_url = env::var("DEADDROP_RELAY_URL").ok();
    let mut rest = Vec::new();
    let mut index = 0;
    while index < args.len() {
        if args[index] == "--relay" {
            index += 1;
            if index >= args.len() {
                return Err("--relay requires a URL".into());
            }
            relay_url = Some(args[index].clone());
        } else {
            rest.push(args[index].clone());
        }
        index += 1;
    }
    Ok((relay_url, rest))
}

fn init_identity(args: &[String]) -> Result<(), Box<dyn Error>> {
    let (relay_url, rest) = split_relay_flag(args)?;
    if rest.len() < 2 {
        return Err("init requires <name> <shared_secret>".into());
    }
    let name = &rest[0];
    let secret = &rest[1];

    let store = open_store()?;
    if let Some(existing) = store.get_value(KV_IDENTITY_ID)? {
        println!("identity already exists: {existing}");
        return Ok(());
    }

    let id = derive_user_id(name, secret);
    store.set_value(KV_IDENTITY_ID, &id)?;
    store.set_value(KV_IDENTITY_SECRET, secret)?;
    println!("identity created: {id}");

    if let Some(relay_url) = relay_url {
        match post_register(&relay_url, &id, None) {
            Ok(()) => println!("registered with relay {relay_url}"),
            Err(error) => eprintln!("warning: relay registration failed: {error}"),
        }
    }
    Ok(())
}

fn link_peer(args: &[String]) -> Result<(), Box<dyn Error>> {
    if args.is_empty() {
        return Err("link requires <peer_id>".into());
    }
    let store = open_store()?;
    load_identity(&store)?;
    store.set_last_peer(&args[0])?;
    println!("linked to peer: {}", args[0]);
    Ok(())
}

fn send_message(args: &[String]) -> Result<(), Box<dyn Error>> {
    let (relay_url, words) = split_relay_flag(args)?;
    let relay_url = relay_url.ok_or("relay URL required (use --relay or DEADDROP_RELAY_URL)")?;
    let body = words.join(" ");
    if body.trim().is_empty() {
        return Err("send requires a message".into());
    }

    let store = open_store()?;
    let identity = load_identity(&store)?;
    let peer_id = store.last_peer()?.ok_or("no linked peer; run link first")?;

    let created_at = now_millis().max(store.last_created_at()? + 1);
    let message = Message::new(&identity.id, &peer_id, MessageKind::Text, body, created_at);
    store.insert_outbox(&message)?;

    // The new message joins whatever is still pending; oldest goes first so
    // per-sender ordering holds at the relay.
    for pending in store.list_pending()? {
        let key =
            derive_conversation_key(&identity.secret, &identity.id, &pending.recipient_id);
        let envelope = seal_message(&key, &pending)?;
        match post_enqueue(&relay_url, &pending.recipient_id, &envelope) {
            Ok(()) => {
                store.advance_status(&pending.id, DeliveryStatus::Sent)?;
                println!("sent {}", pending.id);
            }
            Err(error) => {
                eprintln!("relay unavailable, {} left pending: {error}", pending.id);
                break;
            }
        }
    }
    Ok(())
}

fn sync_messages(args: &[String]) -> Result<(), Box<dyn Error>> {
    let (relay_url, rest) = split_relay_flag(args)?;
    let relay_url = relay_url.ok_or("relay URL required (use --relay or DEADDROP_RELAY_URL)")?;
    let wait = rest.iter().any(|arg| arg == "--wait");

    let store = open_store()?;
    let identity = load_identity(&store)?;

    let since = store.last_sync()?;
    let envelopes = fetch_sync(&relay_url, &identity.id, Some(since), wait)?;
    if envelopes.is_empty() {
        println!("no new messages");
        return Ok(());
    }

    let mut watermark = since;
    let mut fetched_ids = Vec::with_capacity(envelopes.len());
    let mut fresh = 0;
    for envelope in &envelopes {
        fetched_ids.push(envelope.id.0.clone());
        watermark = watermark.max(envelope.created_at);
        if store.has_seen(&envelope.id)? {
            continue;
        }
        let key = derive_conversation_key(&identity.secret, &identity.id, &envelope.sender_id);
        let message = match open_envelope(&key, envelope) {
            Ok(message) => message,
            Err(error) => {
                eprintln!("dropping undecryptable message {}: {error}", envelope.id);
                continue;
            }
        };
        let now = now_millis();
        store.record_seen(&message.id, now)?;
        store.insert_feed(&message, now)?;
        println!("[{}] {}: {}", message.created_at, message.sender_id, message.body);
        fresh += 1;
    }

    // Ack everything fetched, decryptable or not, so nothing retries forever.
    post_ack(&relay_url, &identity.id, &fetched_ids)?;
    store.set_last_sync(watermark)?;
    println!("{fresh} new message(s)");
    Ok(())
}

fn show_feed() -> Result<(), Box<dyn Error>> {
    let store = open_store()?;
    let feed = store.list_feed()?;
    if feed.is_empty() {
        println!("feed is empty");
        return Ok(());
    }
    for message in feed {
        println!("[{}] {}: {}", message.created_at, message.sender_id, message.body);
    }
    Ok(())
}
