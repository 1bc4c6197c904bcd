// Focus and cancellation tests

mod common;
use common::{next_event, wait_for, World};

use anyhow::Result;
use tokio::time::{sleep, Duration as TokioDuration};

use xchat::models::MessageKind;
use xchat::sync::{ChatFocus, MessageStream, TypingSignal};

#[tokio::test]
async fn test_cancel_drops_queued_notification() -> Result<()> {
    let world = World::new();
    let amy = world.session("amy").await?;
    let bob = world.session("bob").await?;
    let chat = world.conversation(&amy, &["bob"]).await?;

    let mut live = MessageStream::new(bob.clone()).subscribe(&chat).await?;
    wait_for(&mut live, |messages| messages.is_empty()).await?;

    MessageStream::new(amy.clone())
        .send(&chat, "too late", MessageKind::Text)
        .await?;
    // Let the pump queue the snapshot before cancelling
    sleep(TokioDuration::from_millis(50)).await;

    live.cancel();
    assert!(next_event(&mut live).await?.is_none());
    assert!(live.try_next().is_none());
    Ok(())
}

#[tokio::test]
async fn test_switching_focus_cancels_previous_feeds() -> Result<()> {
    let world = World::new();
    let amy = world.session("amy").await?;
    world.session("bob").await?;
    world.session("carol").await?;
    let with_bob = world.conversation(&amy, &["bob"]).await?;
    let with_carol = world.conversation(&amy, &["carol"]).await?;

    let mut focus = ChatFocus::new(amy.clone());
    let first = focus.select(&with_bob).await?;
    wait_for(&mut first.messages, |_| true).await?;
    let old_messages = first.messages.cancel_handle();
    let old_typing = first.typing.cancel_handle();

    let second = focus.select(&with_carol).await?;
    assert!(!old_messages.is_active());
    assert!(!old_typing.is_active());
    assert_eq!(second.conversation_id, with_carol);
    wait_for(&mut second.messages, |messages| messages.is_empty()).await?;

    let stream = MessageStream::new(amy.clone());
    stream.send(&with_bob, "for bob", MessageKind::Text).await?;
    stream.send(&with_carol, "for carol", MessageKind::Text).await?;

    let chat = focus.current_mut().ok_or_else(|| anyhow::anyhow!("focus lost"))?;
    let messages = wait_for(&mut chat.messages, |messages| !messages.is_empty()).await?;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "for carol");
    Ok(())
}

#[tokio::test]
async fn test_clearing_focus_lowers_own_typing_flag() -> Result<()> {
    let world = World::new();
    let amy = world.session("amy").await?;
    let bob = world.session("bob").await?;
    let chat = world.conversation(&amy, &["bob"]).await?;

    let mut focus = ChatFocus::new(amy.clone());
    focus.select(&chat).await?;
    TypingSignal::new(amy.clone()).set_typing(&chat, true).await?;
    assert_eq!(TypingSignal::new(bob.clone()).typing_now(&chat).await?, vec!["amy".to_string()]);

    focus.clear().await;
    assert!(focus.current().is_none());
    assert!(focus.conversation_id().is_none());
    assert!(TypingSignal::new(bob.clone()).typing_now(&chat).await?.is_empty());
    Ok(())
}
