// Session tests: provisioning, sign-out, presence and reconnects

mod common;
use common::{next_event, wait_for, World};

use anyhow::Result;
use serde_json::json;

use xchat::models::{Identity, MessageKind};
use xchat::store::{DocPath, Store};
use xchat::sync::{ChatDirectory, MessageStream, Presence, ProfileUpdate, SyncEvent};
use xchat::ChatError;

#[tokio::test]
async fn test_racing_bootstraps_provision_once() -> Result<()> {
    let world = World::new();
    let first = world.signed_in("amy");
    let second = world.signed_in("amy");

    let (a, b) = tokio::join!(first.bootstrap(), second.bootstrap());
    let (a, b) = (a?, b?);
    assert_eq!(a.map(|i| i.uid), Some("amy".to_string()));
    assert_eq!(b.map(|i| i.display_name), Some(Identity::DEFAULT_NAME.to_string()));

    let doc = world.store.get(&DocPath::new("users", "amy")).await?.unwrap();
    assert_eq!(doc.field("bio"), Some(&json!("Available")));
    assert_eq!(doc.field("email"), Some(&json!("amy@example.com")));
    Ok(())
}

#[tokio::test]
async fn test_returning_identity_is_not_overwritten() -> Result<()> {
    let world = World::new();
    let amy = world.session("amy").await?;
    Presence::new(amy.clone())
        .update_profile(ProfileUpdate {
            display_name: Some("Amy Pond".to_string()),
            bio: Some("At work".to_string()),
            ..ProfileUpdate::default()
        })
        .await?;
    amy.sign_out().await?;

    let again = world.session("amy").await?;
    let identity = again.require_identity()?;
    assert_eq!(identity.display_name, "Amy Pond");
    assert_eq!(identity.bio, "At work");
    assert!(identity.online_status);
    Ok(())
}

#[tokio::test]
async fn test_sign_out_ends_every_subscription() -> Result<()> {
    let world = World::new();
    let amy = world.session("amy").await?;
    world.session("bob").await?;
    let chat = world.conversation(&amy, &["bob"]).await?;

    let mut list = ChatDirectory::new(amy.clone()).subscribe()?;
    let mut messages = MessageStream::new(amy.clone()).subscribe(&chat).await?;
    wait_for(&mut list, |_| true).await?;
    wait_for(&mut messages, |_| true).await?;
    assert_eq!(amy.active_subscriptions(), 2);

    amy.sign_out().await?;
    assert_eq!(amy.active_subscriptions(), 0);
    assert!(!list.is_active());
    assert!(next_event(&mut list).await?.is_none());
    assert!(next_event(&mut messages).await?.is_none());
    assert!(matches!(amy.require_uid(), Err(ChatError::Unauthorized(_))));

    let doc = world.store.get(&DocPath::new("users", "amy")).await?.unwrap();
    assert_eq!(doc.field("onlineStatus"), Some(&json!(false)));
    Ok(())
}

#[tokio::test]
async fn test_subscription_recovers_from_outage() -> Result<()> {
    let world = World::new();
    let amy = world.session("amy").await?;
    let bob = world.session("bob").await?;
    let chat = world.conversation(&amy, &["bob"]).await?;

    let mut live = MessageStream::new(bob.clone()).subscribe(&chat).await?;
    wait_for(&mut live, |messages| messages.is_empty()).await?;

    world.store.set_offline(true);
    match next_event(&mut live).await? {
        Some(SyncEvent::Reconnecting { attempt, .. }) => assert_eq!(attempt, 1),
        other => panic!("expected a reconnect notice, got {:?}", other),
    }
    let send = MessageStream::new(amy.clone()).send(&chat, "lost", MessageKind::Text).await;
    assert!(matches!(send, Err(ChatError::Unavailable(_))));

    world.store.set_offline(false);
    MessageStream::new(amy.clone())
        .send(&chat, "back again", MessageKind::Text)
        .await?;
    let messages = wait_for(&mut live, |messages| !messages.is_empty()).await?;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "back again");
    Ok(())
}

#[tokio::test]
async fn test_presence_and_profile_edits() -> Result<()> {
    let world = World::new();
    let amy = world.session("amy").await?;
    let bob = world.session("bob").await?;

    let mut watching = Presence::new(amy.clone()).watch("bob")?;
    wait_for(&mut watching, |bob| bob.as_ref().map_or(false, |b| b.online_status)).await?;

    let bob_presence = Presence::new(bob.clone());
    bob_presence.go_offline().await?;
    let seen = wait_for(&mut watching, |bob| bob.as_ref().map_or(false, |b| !b.online_status)).await?;
    assert_eq!(seen.map(|b| b.status), Some("offline".to_string()));
    assert!(!bob.require_identity()?.online_status);

    assert!(matches!(
        bob_presence
            .update_profile(ProfileUpdate {
                display_name: Some("   ".to_string()),
                ..ProfileUpdate::default()
            })
            .await,
        Err(ChatError::InvalidArgument(_))
    ));

    let updated = bob_presence
        .update_profile(ProfileUpdate {
            phone_number: Some("+15550100".to_string()),
            ..ProfileUpdate::default()
        })
        .await?;
    assert_eq!(updated.phone_number, "+15550100");
    assert!(!updated.is_phone_verified);
    assert_eq!(Presence::new(amy.clone()).profile("bob").await?.phone_number, "+15550100");
    assert!(matches!(
        Presence::new(amy.clone()).profile("ghost").await,
        Err(ChatError::NotFound(_))
    ));
    Ok(())
}
