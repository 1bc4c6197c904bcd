// Typing signal tests: visibility to peers and the liveness window

mod common;
use common::{wait_for, World};

use anyhow::Result;
use chrono::Duration;
use serde_json::json;

use xchat::store::{DocPath, Store};
use xchat::sync::TypingSignal;
use xchat::ChatError;

#[tokio::test]
async fn test_peer_sees_flag_rise_and_fall() -> Result<()> {
    let world = World::new();
    let amy = world.session("amy").await?;
    let bob = world.session("bob").await?;
    let chat = world.conversation(&amy, &["bob"]).await?;

    let mut watching = TypingSignal::new(bob.clone()).subscribe(&chat).await?;
    wait_for(&mut watching, |typing| typing.is_empty()).await?;

    let amy_typing = TypingSignal::new(amy.clone());
    amy_typing.set_typing(&chat, true).await?;
    let typing = wait_for(&mut watching, |typing| !typing.is_empty()).await?;
    assert_eq!(typing, vec!["amy".to_string()]);

    amy_typing.set_typing(&chat, false).await?;
    wait_for(&mut watching, |typing| typing.is_empty()).await?;
    Ok(())
}

#[tokio::test]
async fn test_stale_flag_reads_false_for_new_subscriber() -> Result<()> {
    let world = World::new();
    let amy = world.session("amy").await?;
    let bob = world.session("bob").await?;
    let chat = world.conversation(&amy, &["bob"]).await?;

    TypingSignal::new(amy.clone()).set_typing(&chat, true).await?;
    world.clock.advance(Duration::seconds(9));

    // Still raised in the store...
    let doc = world
        .store
        .get(&DocPath::new(&format!("chats/{}/typing", chat), "amy"))
        .await?
        .ok_or_else(|| anyhow::anyhow!("typing flag missing"))?;
    assert_eq!(doc.field("isTyping"), Some(&json!(true)));

    // ...but too old to count
    let signal = TypingSignal::new(bob.clone());
    assert!(signal.typing_now(&chat).await?.is_empty());
    let mut watching = signal.subscribe(&chat).await?;
    let first = wait_for(&mut watching, |_| true).await?;
    assert!(first.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_flag_expires_without_new_writes() -> Result<()> {
    let world = World::new();
    let amy = world.session("amy").await?;
    let bob = world.session("bob").await?;
    let chat = world.conversation(&amy, &["bob"]).await?;

    TypingSignal::new(amy.clone()).set_typing(&chat, true).await?;
    let mut watching = TypingSignal::new(bob.clone()).subscribe(&chat).await?;
    wait_for(&mut watching, |typing| typing == &vec!["amy".to_string()]).await?;

    world.clock.advance(Duration::seconds(8));
    assert_eq!(TypingSignal::new(bob.clone()).typing_now(&chat).await?, vec!["amy".to_string()]);

    world.clock.advance(Duration::seconds(1));
    wait_for(&mut watching, |typing| typing.is_empty()).await?;
    Ok(())
}

#[tokio::test]
async fn test_own_flag_is_not_reported() -> Result<()> {
    let world = World::new();
    let amy = world.session("amy").await?;
    world.session("bob").await?;
    let chat = world.conversation(&amy, &["bob"]).await?;

    let signal = TypingSignal::new(amy.clone());
    signal.set_typing(&chat, true).await?;
    assert!(signal.typing_now(&chat).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_outsider_cannot_signal() -> Result<()> {
    let world = World::new();
    let amy = world.session("amy").await?;
    world.session("bob").await?;
    let carol = world.session("carol").await?;
    let chat = world.conversation(&amy, &["bob"]).await?;

    let signal = TypingSignal::new(carol.clone());
    assert!(matches!(signal.set_typing(&chat, true).await, Err(ChatError::Unauthorized(_))));
    assert!(matches!(signal.subscribe(&chat).await, Err(ChatError::Unauthorized(_))));
    Ok(())
}
