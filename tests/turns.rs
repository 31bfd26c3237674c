mod common;

use std::time::Duration;

use common::{Harness, Options, Script, MODEL_ID};
use persona_turns::cancel::CancelToken;
use persona_turns::db::memory::StoreArea;
use persona_turns::models::{
    ConversationMode, ConversationSettings, MessageRole, TransactionKind, TurnEvent, TurnRequest,
};
use persona_turns::service::generation::TurnUpdate;
use tokio::sync::mpsc;

fn paid() -> Options {
    Options { daily_free_tokens: 0, cost: 5, free_tier: false, ..Default::default() }
}

async fn refunds(h: &Harness, user: &str) -> usize {
    h.ledger
        .transactions(user, 500)
        .await
        .unwrap()
        .iter()
        .filter(|t| t.kind == TransactionKind::Refund)
        .count()
}

#[tokio::test]
async fn free_tokens_are_restored_when_the_stream_fails() {
    let h = Harness::new(Options { daily_free_tokens: 5, cost: 3, ..Default::default() });
    let chat = h.chat("u1").await;
    h.backend.push(Script::errors(1));

    let err = h.send("u1", &chat, "hello").await.unwrap_err();
    assert_eq!(err.code(), "STREAM_FAILED");

    let account = h.ledger.account("u1").await.unwrap();
    assert_eq!(account.daily_tokens_used, 0);
    assert_eq!(account.balance, 0);

    let txs = h.ledger.transactions("u1", 10).await.unwrap();
    assert_eq!(txs.len(), 2);
    assert_eq!(txs[0].kind, TransactionKind::Refund);
    assert_eq!(txs[0].tokens_from_free, 3);
    assert_eq!(txs[1].kind, TransactionKind::Spend);
}

#[tokio::test]
async fn paid_turn_spends_purchased_tokens_and_links_reply_to_user_message() {
    let h = Harness::new(paid());
    h.ledger.purchase("u1", 10, Some("order-1")).await.unwrap();
    let chat = h.chat("u1").await;
    h.backend.push(Script::chunks(&["Hel", "lo ", "there"]));

    let result = h.send("u1", &chat, "hi").await.unwrap();

    let user = result.user_message.expect("send stores the user message");
    assert_eq!(result.assistant_message.parent_id.as_deref(), Some(user.id.as_str()));
    assert_eq!(result.assistant_message.text(), "Hello there");
    assert_eq!(result.reservation.tokens_from_purchased, 5);
    assert_eq!(result.assistant_message.metadata.cost, 5);
    assert_eq!(result.assistant_message.metadata.model_id.as_deref(), Some(MODEL_ID));

    assert_eq!(h.ledger.account("u1").await.unwrap().balance, 5);
    assert_eq!(refunds(&h, "u1").await, 0);
}

#[tokio::test]
async fn regenerate_on_user_leaf_is_rejected_without_touching_the_ledger() {
    let h = Harness::new(Options::default());
    let chat = h.chat("u1").await;
    h.backend.push(Script::errors(1));
    h.send("u1", &chat, "hello").await.unwrap_err();
    let before = h.ledger.transactions("u1", 50).await.unwrap().len();

    let leaf = h.tree.current_leaf(&chat).await.unwrap().unwrap();
    assert_eq!(leaf.role, MessageRole::User);

    let err = h.regenerate("u1", &chat).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_EVENT_SEQUENCE");
    assert_eq!(h.ledger.transactions("u1", 50).await.unwrap().len(), before);
    assert_eq!(h.backend.calls(), 1);
}

#[tokio::test]
async fn send_on_user_leaf_is_rejected() {
    let h = Harness::new(Options::default());
    let chat = h.chat("u1").await;
    h.backend.push(Script::errors(1));
    h.send("u1", &chat, "first").await.unwrap_err();

    let err = h.send("u1", &chat, "second").await.unwrap_err();
    assert_eq!(err.code(), "INVALID_EVENT_SEQUENCE");
    assert_eq!(h.tree.messages(&chat).await.unwrap().len(), 1);
}

#[tokio::test]
async fn chat_whose_first_turn_failed_can_take_another_turn() {
    let h = Harness::new(Options { daily_free_tokens: 50, ..Default::default() });
    let chat = h.chat("u1").await;
    h.backend.push(Script::errors(1));
    h.send("u1", &chat, "hello").await.unwrap_err();
    let root = h.tree.current_leaf(&chat).await.unwrap().unwrap();

    h.backend.push(Script::reply("welcome back"));
    let retried = h.retry("u1", &chat).await.unwrap();
    assert!(retried.user_message.is_none());
    assert_eq!(retried.assistant_message.parent_id.as_deref(), Some(root.id.as_str()));
    assert_eq!(retried.assistant_message.text(), "welcome back");

    let history = h.backend.last_request().unwrap().history;
    let texts: Vec<&str> = history.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(texts, vec!["hello"]);

    let next = h.send("u1", &chat, "and now?").await.unwrap();
    let asked = next.user_message.unwrap();
    assert_eq!(asked.parent_id.as_deref(), Some(retried.assistant_message.id.as_str()));
    assert_eq!(h.tree.messages(&chat).await.unwrap().len(), 4);
}

#[tokio::test]
async fn retry_needs_an_unanswered_user_leaf() {
    let h = Harness::new(Options { daily_free_tokens: 50, ..Default::default() });
    let chat = h.chat("u1").await;

    let err = h.retry("u1", &chat).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_EVENT_SEQUENCE");

    let first = h.send("u1", &chat, "one").await.unwrap();
    let err = h.retry("u1", &chat).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_EVENT_SEQUENCE");

    // A user message that already has a reply cannot be retried.
    h.cache.set(&chat, &first.user_message.unwrap().id).await;
    let err = h.retry("u1", &chat).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_EVENT_SEQUENCE");
    assert_eq!(h.backend.calls(), 1);
}

#[tokio::test]
async fn stream_error_ends_the_turn_without_waiting_for_the_timeout() {
    let h = Harness::new(Options { stream_timeout: Duration::from_secs(5), ..Default::default() });
    let chat = h.chat("u1").await;
    h.backend.push(Script { hang: true, ..Script::errors(1) });

    let started = std::time::Instant::now();
    let err = h.send("u1", &chat, "hello").await.unwrap_err();

    assert_eq!(err.code(), "STREAM_FAILED");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(h.backend.last_cancel().unwrap().is_cancelled());
    assert_eq!(refunds(&h, "u1").await, 1);
}

#[tokio::test]
async fn refund_lands_before_the_error_even_when_the_timeout_fires_mid_rollback() {
    let h = Harness::new(Options {
        stream_timeout: Duration::from_millis(50),
        ..Default::default()
    });
    let chat = h.chat("u1").await;
    h.store.set_refund_delay(Some(Duration::from_millis(300)));
    h.backend.push(Script::errors(1));

    let err = h.send("u1", &chat, "hello").await.unwrap_err();
    assert_eq!(err.code(), "STREAM_FAILED");

    let account = h.ledger.account("u1").await.unwrap();
    assert_eq!(account.daily_tokens_used, 0);
    assert_eq!(refunds(&h, "u1").await, 1);
}

#[tokio::test]
async fn duplicate_stream_errors_refund_exactly_once() {
    let h = Harness::new(Options::default());
    let chat = h.chat("u1").await;
    h.backend.push(Script::errors(2));

    let err = h.send("u1", &chat, "hello").await.unwrap_err();
    assert_eq!(err.code(), "STREAM_FAILED");
    assert!(err.to_string().contains("#0"));
    assert_eq!(refunds(&h, "u1").await, 1);
    assert_eq!(h.ledger.account("u1").await.unwrap().daily_tokens_used, 0);
}

#[tokio::test]
async fn moderation_rejection_is_refunded() {
    let h = Harness::new(Options::default());
    let chat = h.chat("u1").await;
    h.backend.push(Script::moderated());

    let err = h.send("u1", &chat, "hello").await.unwrap_err();
    assert_eq!(err.code(), "MODERATION_REJECTED");
    assert_eq!(refunds(&h, "u1").await, 1);
}

#[tokio::test]
async fn stream_without_finish_is_a_failure() {
    let h = Harness::new(Options::default());
    let chat = h.chat("u1").await;
    h.backend.push(Script {
        events: vec![persona_turns::agent::StreamEvent::Delta("cut".into())],
        delay: Duration::ZERO,
        hang: false,
    });

    let err = h.send("u1", &chat, "hello").await.unwrap_err();
    assert_eq!(err.code(), "STREAM_FAILED");
    assert_eq!(refunds(&h, "u1").await, 1);
}

#[tokio::test]
async fn regenerate_creates_a_sibling_branch() {
    let h = Harness::new(Options { daily_free_tokens: 50, ..Default::default() });
    let chat = h.chat("u1").await;
    h.backend.push(Script::reply("first answer"));
    let first = h.send("u1", &chat, "question").await.unwrap();
    let parent = first.user_message.unwrap().id;

    h.backend.push(Script::reply("second answer"));
    let second = h.regenerate("u1", &chat).await.unwrap();

    assert!(second.user_message.is_none());
    assert_eq!(second.assistant_message.parent_id.as_deref(), Some(parent.as_str()));
    assert_ne!(second.assistant_message.id, first.assistant_message.id);

    let siblings = h.tree.children(&chat, &parent).await.unwrap();
    assert_eq!(siblings.len(), 2);
    assert!(h.tree.message(&chat, &first.assistant_message.id).await.is_ok());

    let leaf = h.tree.current_leaf(&chat).await.unwrap().unwrap();
    assert_eq!(leaf.id, second.assistant_message.id);

    // The regenerated reply sees the same context, ending with the question.
    let request = h.backend.last_request().unwrap();
    assert_eq!(request.history.len(), 1);
    assert_eq!(request.history[0].content, "question");
}

#[tokio::test]
async fn edit_branches_from_the_parent_of_the_edited_message() {
    let h = Harness::new(Options { daily_free_tokens: 50, ..Default::default() });
    let chat = h.chat("u1").await;
    let first = h.send("u1", &chat, "one").await.unwrap();
    let second = h.send("u1", &chat, "two").await.unwrap();
    let edited_id = second.user_message.unwrap().id;

    let edit = TurnEvent::Edit { message_id: edited_id.clone(), text: "two, reworded".into() };
    let result = h.turn("u1", &chat, edit).await.unwrap();

    let replacement = result.user_message.unwrap();
    assert_eq!(replacement.parent_id.as_deref(), Some(first.assistant_message.id.as_str()));
    assert_ne!(replacement.id, edited_id);
    assert!(h.tree.message(&chat, &edited_id).await.is_ok());
    assert_eq!(h.tree.messages(&chat).await.unwrap().len(), 6);

    let history = h.backend.last_request().unwrap().history;
    let texts: Vec<&str> = history.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(texts, vec!["one", "ok", "two, reworded"]);
}

#[tokio::test]
async fn editing_the_root_message_is_rejected() {
    let h = Harness::new(Options { daily_free_tokens: 50, ..Default::default() });
    let chat = h.chat("u1").await;
    let first = h.send("u1", &chat, "one").await.unwrap();
    let root = first.user_message.unwrap().id;

    let err = h
        .turn("u1", &chat, TurnEvent::Edit { message_id: root, text: "zero".into() })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_EVENT_SEQUENCE");
}

#[tokio::test]
async fn stale_leaf_pointer_yields_the_same_context() {
    let h = Harness::new(Options { daily_free_tokens: 50, ..Default::default() });
    let chat = h.chat("u1").await;
    h.send("u1", &chat, "one").await.unwrap();
    h.send("u1", &chat, "two").await.unwrap();

    let leaf = h.tree.current_leaf(&chat).await.unwrap().unwrap();
    let fresh = h.tree.resolve_ancestor_chain(&chat, &leaf.id, 200).await.unwrap();

    let other = h.chat("u1").await;
    let foreign = h.send("u1", &other, "elsewhere").await.unwrap();
    h.cache.set(&chat, &foreign.assistant_message.id).await;

    let recovered = h.tree.current_leaf(&chat).await.unwrap().unwrap();
    assert_eq!(recovered.id, leaf.id);
    let chain = h.tree.resolve_ancestor_chain(&chat, &recovered.id, 200).await.unwrap();
    let ids = |c: &[persona_turns::models::Message]| c.iter().map(|m| m.id.clone()).collect::<Vec<_>>();
    assert_eq!(ids(&chain[..]), ids(&fresh[..]));

    h.cache.invalidate(&chat).await;
    assert_eq!(h.tree.current_leaf(&chat).await.unwrap().unwrap().id, leaf.id);
}

#[tokio::test]
async fn context_is_capped_at_the_configured_window() {
    let h = Harness::new(Options {
        daily_free_tokens: 100,
        max_context_messages: 3,
        ..Default::default()
    });
    let chat = h.chat("u1").await;
    for text in ["a", "b", "c"] {
        h.send("u1", &chat, text).await.unwrap();
    }

    let history = h.backend.last_request().unwrap().history;
    let texts: Vec<&str> = history.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(texts, vec!["b", "ok", "c"]);
}

#[tokio::test]
async fn timeout_rolls_the_turn_back() {
    let h = Harness::new(Options {
        stream_timeout: Duration::from_millis(100),
        ..Default::default()
    });
    let chat = h.chat("u1").await;
    h.backend.push(Script::hanging("thinking"));

    let err = h.send("u1", &chat, "hello").await.unwrap_err();
    assert_eq!(err.code(), "STREAM_TIMEOUT");
    assert_eq!(refunds(&h, "u1").await, 1);
    assert_eq!(h.ledger.account("u1").await.unwrap().daily_tokens_used, 0);

    let messages = h.tree.messages(&chat).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, MessageRole::User);
}

#[tokio::test]
async fn cancellation_mid_stream_refunds() {
    let h = Harness::new(Options::default());
    let chat = h.chat("u1").await;
    h.backend.push(Script::hanging("partial"));

    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancelToken::new();
    let turns = h.turns.clone();
    let request = TurnRequest {
        chat_id: chat.clone(),
        event: TurnEvent::Send { text: "hello".into() },
        model_id: None,
        generate_image: false,
    };
    let token = cancel.clone();
    let handle = tokio::spawn(async move { turns.run_turn("u1", request, Some(tx), token).await });

    assert!(matches!(rx.recv().await, Some(TurnUpdate::Started { .. })));
    assert_eq!(rx.recv().await, Some(TurnUpdate::Delta("partial".into())));
    cancel.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert_eq!(err.code(), "CANCELLED");
    assert_eq!(refunds(&h, "u1").await, 1);
    assert_eq!(h.ledger.account("u1").await.unwrap().daily_tokens_used, 0);
}

#[tokio::test]
async fn commit_failure_refunds_the_reservation() {
    let h = Harness::new(Options::default());
    let chat = h.chat("u1").await;
    h.backend.push(Script {
        delay: Duration::from_millis(100),
        ..Script::reply("lost reply")
    });

    let (tx, mut rx) = mpsc::channel(16);
    let turns = h.turns.clone();
    let request = TurnRequest {
        chat_id: chat.clone(),
        event: TurnEvent::Send { text: "hello".into() },
        model_id: None,
        generate_image: false,
    };
    let handle =
        tokio::spawn(async move { turns.run_turn("u1", request, Some(tx), CancelToken::new()).await });

    assert!(matches!(rx.recv().await, Some(TurnUpdate::Started { .. })));
    h.store.set_failing(StoreArea::Messages, true);

    let err = handle.await.unwrap().unwrap_err();
    assert_eq!(err.code(), "STORE_UNAVAILABLE");
    assert_eq!(refunds(&h, "u1").await, 1);
    assert_eq!(h.ledger.account("u1").await.unwrap().daily_tokens_used, 0);
}

#[tokio::test]
async fn concurrent_turns_never_overdraw() {
    let h = Harness::new(Options { daily_free_tokens: 0, cost: 3, free_tier: false, ..Default::default() });
    h.ledger.purchase("u1", 5, None).await.unwrap();
    let a = h.chat("u1").await;
    let b = h.chat("u1").await;

    let (first, second) = tokio::join!(h.send("u1", &a, "left"), h.send("u1", &b, "right"));
    let outcomes = [first, second];
    let ok = outcomes.iter().filter(|r| r.is_ok()).count();
    let insufficient = outcomes
        .iter()
        .filter(|r| matches!(r, Err(e) if e.code() == "INSUFFICIENT_TOKENS"))
        .count();

    assert_eq!((ok, insufficient), (1, 1));
    assert_eq!(h.ledger.account("u1").await.unwrap().balance, 2);
}

#[tokio::test]
async fn free_model_requests_are_rate_limited() {
    let h = Harness::new(Options { daily_free_tokens: 50, free_requests: 1, ..Default::default() });
    let chat = h.chat("u1").await;
    h.send("u1", &chat, "one").await.unwrap();
    let before = h.ledger.transactions("u1", 50).await.unwrap().len();

    let err = h.send("u1", &chat, "two").await.unwrap_err();
    assert_eq!(err.code(), "RATE_LIMITED");
    assert_eq!(h.ledger.transactions("u1", 50).await.unwrap().len(), before);
    assert_eq!(h.backend.calls(), 1);
}

#[tokio::test]
async fn ledger_is_conserved_across_mixed_outcomes() {
    let h = Harness::new(Options { daily_free_tokens: 4, cost: 3, ..Default::default() });
    h.ledger.purchase("u1", 20, None).await.unwrap();
    let chat = h.chat("u1").await;

    h.backend.push(Script::reply("fine"));
    h.backend.push(Script::errors(1));
    let committed = h.send("u1", &chat, "one").await.unwrap().assistant_message;
    h.send("u1", &chat, "two").await.unwrap_err();
    let retried = h.retry("u1", &chat).await.unwrap();
    assert_ne!(retried.assistant_message.id, committed.id);
    h.send("u1", &chat, "three").await.unwrap();

    let account = h.ledger.account("u1").await.unwrap();
    let txs = h.ledger.transactions("u1", 500).await.unwrap();
    let sum = |kind: TransactionKind| -> i64 {
        txs.iter().filter(|t| t.kind == kind).map(|t| t.amount.abs()).sum()
    };
    let net_spent = sum(TransactionKind::Spend) - sum(TransactionKind::Refund);

    assert_eq!(net_spent, 9);
    assert_eq!(account.total_spent, net_spent);
    assert_eq!(account.daily_tokens_used, 4);
    assert_eq!(account.balance, 15);
    assert_eq!(
        sum(TransactionKind::Purchase) - account.balance + account.daily_tokens_used,
        net_spent
    );
}

#[tokio::test]
async fn side_job_is_queued_after_commit() {
    let h = Harness::with_images(
        Options { daily_free_tokens: 5, cost: 3, image_cost: 2, ..Default::default() },
        common::ScriptedImages::succeeding(),
    );
    let chat = h
        .tree
        .create_conversation(
            "u1",
            ConversationMode::Story,
            ConversationSettings { image_generation: true, ..Default::default() },
        )
        .await
        .unwrap()
        .id;

    let result = h.send("u1", &chat, "draw me a castle").await.unwrap();
    assert!(result.side_job_enqueued);

    let images = h.images.clone().unwrap();
    for _ in 0..100 {
        if images.calls.load(std::sync::atomic::Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(images.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    let reason = format!("image_job:{}", result.assistant_message.id);
    let txs = h.ledger.transactions("u1", 50).await.unwrap();
    assert!(txs.iter().any(|t| t.reason.as_deref() == Some(reason.as_str())));
}

#[tokio::test]
async fn turns_on_someone_elses_chat_are_forbidden() {
    let h = Harness::new(Options::default());
    let chat = h.chat("owner").await;

    let err = h.send("intruder", &chat, "hi").await.unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    assert_eq!(h.backend.calls(), 0);
}

#[tokio::test]
async fn unknown_model_is_rejected_before_reserving() {
    let h = Harness::new(Options::default());
    let chat = h.chat("u1").await;
    let request = TurnRequest {
        chat_id: chat,
        event: TurnEvent::Send { text: "hi".into() },
        model_id: Some("gpt-unknown".into()),
        generate_image: false,
    };

    let err = h.turns.run_turn("u1", request, None, CancelToken::new()).await.unwrap_err();
    assert_eq!(err.code(), "MODEL_NOT_SUPPORTED");
    assert!(h.ledger.transactions("u1", 10).await.unwrap().is_empty());
}
