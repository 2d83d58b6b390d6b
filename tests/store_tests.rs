//! Persisted-store tests
//!
//! These tests verify:
//! - The conditional-update primitive (write-time precondition re-check)
//! - Direct-chat pair uniqueness
//! - Message storage and cascade deletion
//! - Session resolution

use sqlx::SqlitePool;

use huddle_server::database::{self, ChatPatch, DirectInsert, Precondition};
use huddle_server::events::UserId;

async fn setup_test_db() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create test database");
    database::run_migrations(&pool).await.unwrap();
    pool
}

fn members(ids: &[&str]) -> Vec<UserId> {
    ids.iter().map(|s| s.to_string()).collect()
}

async fn seed_group(pool: &SqlitePool, chat_id: &str, admin: &str, all: &[&str]) {
    database::insert_group_chat(pool, chat_id, "room", admin, &members(all), None)
        .await
        .unwrap();
}

// ============================================================================
// Conditional updates
// ============================================================================

#[tokio::test]
async fn update_matches_only_while_the_admin_precondition_holds() {
    let pool = setup_test_db().await;
    seed_group(&pool, "g1", "alice", &["alice", "bob", "carol"]).await;

    let wrong_admin = database::update_chat_if(
        &pool,
        "g1",
        Precondition { admin: Some("bob"), ..Default::default() },
        &[ChatPatch::Name("stolen")],
    )
    .await
    .unwrap();
    assert!(!wrong_admin);

    let right_admin = database::update_chat_if(
        &pool,
        "g1",
        Precondition { admin: Some("alice"), ..Default::default() },
        &[ChatPatch::Name("kept")],
    )
    .await
    .unwrap();
    assert!(right_admin);

    let chat = database::get_chat(&pool, "g1").await.unwrap().unwrap();
    assert_eq!(chat.name.as_deref(), Some("kept"));
}

#[tokio::test]
async fn stale_membership_snapshot_does_not_match() {
    let pool = setup_test_db().await;
    seed_group(&pool, "g1", "alice", &["alice", "bob", "carol"]).await;

    let stale = database::members_json(&members(&["alice", "bob"]));
    let matched = database::update_chat_if(
        &pool,
        "g1",
        Precondition { members_json: Some(&stale), ..Default::default() },
        &[ChatPatch::Members(&members(&["alice"]))],
    )
    .await
    .unwrap();
    assert!(!matched);

    let live = database::members_json(&members(&["alice", "bob", "carol"]));
    let matched = database::update_chat_if(
        &pool,
        "g1",
        Precondition { members_json: Some(&live), ..Default::default() },
        &[ChatPatch::Members(&members(&["alice", "bob"]))],
    )
    .await
    .unwrap();
    assert!(matched);

    let chat = database::get_chat(&pool, "g1").await.unwrap().unwrap();
    assert_eq!(chat.members, members(&["alice", "bob"]));
}

#[tokio::test]
async fn update_on_a_missing_chat_matches_nothing() {
    let pool = setup_test_db().await;
    let matched = database::update_chat_if(
        &pool,
        "missing",
        Precondition { admin: Some("alice"), ..Default::default() },
        &[ChatPatch::Name("x")],
    )
    .await
    .unwrap();
    assert!(!matched);
}

#[tokio::test]
async fn admin_precondition_never_matches_direct_chats() {
    let pool = setup_test_db().await;
    database::insert_direct_chat(&pool, "d1", "alice", "bob").await.unwrap();

    let matched = database::update_chat_if(
        &pool,
        "d1",
        Precondition { admin: Some("alice"), ..Default::default() },
        &[ChatPatch::Name("nope")],
    )
    .await
    .unwrap();
    assert!(!matched);
}

// ============================================================================
// Direct-chat uniqueness
// ============================================================================

#[tokio::test]
async fn second_direct_insert_for_a_pair_returns_the_existing_chat() {
    let pool = setup_test_db().await;

    let first = database::insert_direct_chat(&pool, "d1", "alice", "bob").await.unwrap();
    assert!(matches!(first, DirectInsert::Created));

    // Same pair in the opposite order hits the same direct_key.
    let second = database::insert_direct_chat(&pool, "d2", "bob", "alice").await.unwrap();
    match second {
        DirectInsert::Existing(chat) => assert_eq!(chat.id, "d1"),
        DirectInsert::Created => panic!("duplicate direct chat was created"),
    }
    assert!(database::get_chat(&pool, "d2").await.unwrap().is_none());
}

#[tokio::test]
async fn direct_key_is_order_independent() {
    assert_eq!(database::direct_key("a", "b"), database::direct_key("b", "a"));
    assert_ne!(database::direct_key("a", "b"), database::direct_key("a", "c"));
}

// ============================================================================
// Messages and cascade deletion
// ============================================================================

#[tokio::test]
async fn messages_list_in_creation_order() {
    let pool = setup_test_db().await;
    seed_group(&pool, "g1", "alice", &["alice", "bob", "carol"]).await;

    for i in 0..3 {
        database::insert_message(&pool, &format!("m{i}"), "g1", "alice", &format!("msg {i}"))
            .await
            .unwrap();
    }

    let listed = database::list_messages(&pool, "g1").await.unwrap();
    assert_eq!(listed.len(), 3);
    assert_eq!(listed[0].content, "msg 0");
    assert_eq!(listed[2].content, "msg 2");
    assert_eq!(database::count_messages(&pool, "g1").await.unwrap(), 3);
}

#[tokio::test]
async fn message_insert_rolls_back_when_the_chat_is_gone() {
    let pool = setup_test_db().await;

    let orphan = database::insert_message(&pool, "m1", "missing", "alice", "hello")
        .await
        .unwrap();
    assert!(orphan.is_none());
    assert_eq!(database::count_messages(&pool, "missing").await.unwrap(), 0);
}

#[tokio::test]
async fn message_insert_advances_the_latest_pointer_with_the_row() {
    let pool = setup_test_db().await;
    seed_group(&pool, "g1", "alice", &["alice", "bob", "carol"]).await;

    let message = database::insert_message(&pool, "m1", "g1", "bob", "hello")
        .await
        .unwrap()
        .expect("chat exists");
    assert_eq!(message.chat_id, "g1");

    let chat = database::get_chat(&pool, "g1").await.unwrap().unwrap();
    assert_eq!(chat.latest_message_id.as_deref(), Some("m1"));
}

#[tokio::test]
async fn delete_requires_the_admin_and_cascades() {
    let pool = setup_test_db().await;
    seed_group(&pool, "g1", "alice", &["alice", "bob", "carol"]).await;
    database::insert_message(&pool, "m1", "g1", "bob", "hello").await.unwrap();

    assert!(!database::delete_chat_if_admin(&pool, "g1", "bob").await.unwrap());
    assert!(database::get_chat(&pool, "g1").await.unwrap().is_some());
    assert_eq!(database::count_messages(&pool, "g1").await.unwrap(), 1);

    assert!(database::delete_chat_if_admin(&pool, "g1", "alice").await.unwrap());
    assert!(database::get_chat(&pool, "g1").await.unwrap().is_none());
    assert_eq!(database::count_messages(&pool, "g1").await.unwrap(), 0);
}

// ============================================================================
// Identity directory / sessions
// ============================================================================

#[tokio::test]
async fn sessions_resolve_to_their_user() {
    let pool = setup_test_db().await;
    database::upsert_user(&pool, "alice", "Alice").await.unwrap();
    database::create_session(&pool, "tok-1", "alice").await.unwrap();

    assert_eq!(
        database::resolve_session(&pool, "tok-1").await.unwrap(),
        Some("alice".to_string())
    );
    assert_eq!(database::resolve_session(&pool, "tok-2").await.unwrap(), None);
}

#[tokio::test]
async fn existence_filter_preserves_order_and_drops_ghosts() {
    let pool = setup_test_db().await;
    database::upsert_user(&pool, "alice", "Alice").await.unwrap();
    database::upsert_user(&pool, "carol", "Carol").await.unwrap();

    let filtered = database::filter_existing_users(
        &pool,
        &members(&["carol", "ghost", "alice"]),
    )
    .await
    .unwrap();
    assert_eq!(filtered, members(&["carol", "alice"]));
}
