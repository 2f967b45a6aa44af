mod support;

use chrono::{Duration as ChronoDuration, Timelike, Utc};
use flowcast::business_hours::{BusinessHoursConfig, DaySchedule};
use flowcast::db;
use flowcast::error::{DispatchError, REASON_NOT_REACHABLE};
use flowcast::flow::FlowGraph;
use flowcast::interactive::{FlowEngine, NewInteractiveCampaign};
use flowcast::session::ContactSession;
use flowcast::types::{InboundOutcome, IncomingMessage, InteractiveStatus, SessionStatus};
use serde_json::{json, Value};
use std::time::Duration;
use support::{contact, harness, Harness};

fn graph(value: Value) -> FlowGraph {
    serde_json::from_value(value).unwrap()
}

fn request(graph: FlowGraph) -> NewInteractiveCampaign {
    NewInteractiveCampaign {
        tenant_id: "tenant-1".to_string(),
        name: "Coupon flow".to_string(),
        graph,
        sender_account_id: None,
        scheduled_at: None,
        business_hours: None,
    }
}

fn reply(phone: &str, text: &str) -> IncomingMessage {
    IncomingMessage {
        contact_phone: phone.to_string(),
        message_content: text.to_string(),
        session_hint: None,
    }
}

/// Ask, then branch on yes/no.
fn yes_no_graph() -> FlowGraph {
    graph(json!({
        "nodes": [
            {"id": "start", "type": "trigger", "data": {"categories": ["vip"]}},
            {"id": "ask", "type": "text", "data": {"text": "Hi {{name}}, want a coupon?"}},
            {"id": "cond", "type": "condition", "data": {"operator": "equals", "value": "yes"}},
            {"id": "coupon", "type": "text", "data": {"text": "Here it is: SAVE10"}},
            {"id": "bye", "type": "text", "data": {"text": "Ok, bye"}}
        ],
        "edges": [
            {"source": "start", "target": "ask"},
            {"source": "ask", "target": "cond"},
            {"source": "cond", "target": "coupon", "sourceHandle": "yes"},
            {"source": "cond", "target": "bye", "sourceHandle": "no"}
        ]
    }))
}

async fn session_of(h: &Harness, campaign_id: &str, contact_id: &str) -> ContactSession {
    db::find_session_for_contact(&h.state.pool, h.state.db_kind, campaign_id, contact_id)
        .await
        .unwrap()
        .unwrap()
}

async fn settles(h: &Harness, campaign_id: &str, contact_id: &str, status: SessionStatus) -> bool {
    support::eventually(move || async move { session_of(h, campaign_id, contact_id).await.status == status }).await
}

async fn setup(h: &Harness, contacts: usize) {
    h.add_account("alpha").await;
    for i in 0..contacts {
        h.add_contact(&contact(
            &format!("c{i}"),
            &format!("55119000000{i:02}"),
            &format!("Name{i}"),
            &["vip"],
        ))
        .await;
    }
}

#[tokio::test]
async fn test_publish_seeds_sessions_and_waits_for_reply() {
    let h = harness().await;
    setup(&h, 2).await;
    let engine = FlowEngine::new(h.state.clone());

    let campaign = engine.create(request(yes_no_graph())).await.unwrap();
    assert_eq!(campaign.status, InteractiveStatus::Draft);

    let report = engine.publish(&campaign.id).await.unwrap();
    assert_eq!(report.contacts, 2);
    assert_eq!(report.started, 2);
    assert_eq!(report.failed, 0);
    assert!(report.deferred_until.is_none());

    let stored = db::get_interactive_campaign(&h.state.pool, h.state.db_kind, &campaign.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, InteractiveStatus::Started);

    let session = session_of(&h, &campaign.id, "c0").await;
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.current_node_id.as_deref(), Some("ask"));
    assert_eq!(session.chat_id.as_deref(), Some("5511900000000@c.us"));
    assert_eq!(session.sender_account.as_deref(), Some("alpha"));
    let visited: Vec<_> = session.visited.iter().map(|v| v.node_id.as_str()).collect();
    assert_eq!(visited, vec!["start", "ask"]);
    assert_eq!(h.gateway.texts_to("5511900000000"), vec!["Hi Name0, want a coupon?"]);
}

#[tokio::test]
async fn test_reply_follows_condition_branch() {
    let h = harness().await;
    setup(&h, 2).await;
    let engine = FlowEngine::new(h.state.clone());
    let campaign = engine.create(request(yes_no_graph())).await.unwrap();
    engine.publish(&campaign.id).await.unwrap();

    let yes = engine.process_incoming_message(reply("+55 11 90000-0000", "  YES ")).await;
    let first = session_of(&h, &campaign.id, "c0").await;
    assert_eq!(yes, InboundOutcome::Completed { session_id: first.id.clone() });
    assert_eq!(first.status, SessionStatus::Completed);
    assert_eq!(first.variables["condition_cond"], json!(true));
    assert_eq!(first.variables["last_message"], json!("  YES "));
    assert_eq!(
        h.gateway.texts_to("5511900000000").last().map(String::as_str),
        Some("Here it is: SAVE10")
    );

    let no = engine.process_incoming_message(reply("5511900000001", "nope")).await;
    assert!(matches!(no, InboundOutcome::Completed { .. }));
    assert_eq!(h.gateway.texts_to("5511900000001").last().map(String::as_str), Some("Ok, bye"));

    // finished sessions no longer capture replies
    let late = engine.process_incoming_message(reply("5511900000000", "hello?")).await;
    assert!(matches!(late, InboundOutcome::Ignored { .. }));
}

#[tokio::test]
async fn test_switch_routes_by_case_and_default() {
    let h = harness().await;
    setup(&h, 2).await;
    let engine = FlowEngine::new(h.state.clone());
    let flow = graph(json!({
        "nodes": [
            {"id": "start", "type": "trigger"},
            {"id": "menu", "type": "text", "data": {"text": "Pick 1 or 2"}},
            {"id": "cond", "type": "condition", "data": {
                "mode": "switch",
                "cases": [{"value": "1"}, {"operator": "contains", "value": "two"}]
            }},
            {"id": "one", "type": "text", "data": {"text": "You picked one"}},
            {"id": "two", "type": "text", "data": {"text": "You picked two"}},
            {"id": "other", "type": "text", "data": {"text": "Not an option"}}
        ],
        "edges": [
            {"source": "start", "target": "menu"},
            {"source": "menu", "target": "cond"},
            {"source": "cond", "target": "one", "sourceHandle": "case-0"},
            {"source": "cond", "target": "two", "sourceHandle": "case-1"},
            {"source": "cond", "target": "other", "sourceHandle": "default"}
        ]
    }));
    let campaign = engine.create(request(flow)).await.unwrap();
    let report = engine.publish(&campaign.id).await.unwrap();
    // a trigger without categories targets every contact of the tenant
    assert_eq!(report.started, 2);

    engine.process_incoming_message(reply("5511900000000", "number two please")).await;
    assert_eq!(
        h.gateway.texts_to("5511900000000").last().map(String::as_str),
        Some("You picked two")
    );
    let session = session_of(&h, &campaign.id, "c0").await;
    assert_eq!(session.variables["condition_cond"], json!("case-1"));

    engine.process_incoming_message(reply("5511900000001", "banana")).await;
    assert_eq!(
        h.gateway.texts_to("5511900000001").last().map(String::as_str),
        Some("Not an option")
    );
    let session = session_of(&h, &campaign.id, "c1").await;
    assert_eq!(session.variables["condition_cond"], json!("no_match"));
}

#[tokio::test]
async fn test_delay_timer_moves_session_on() {
    let h = harness().await;
    setup(&h, 1).await;
    let engine = FlowEngine::new(h.state.clone());
    let flow = graph(json!({
        "nodes": [
            {"id": "start", "type": "trigger"},
            {"id": "hello", "type": "text", "data": {"text": "Hello"}},
            {"id": "wait", "type": "delay", "data": {"seconds": 1}},
            {"id": "later", "type": "text", "data": {"text": "Still there?"}}
        ],
        "edges": [
            {"source": "start", "target": "hello"},
            {"source": "hello", "target": "wait"},
            {"source": "wait", "target": "later"}
        ]
    }));
    let campaign = engine.create(request(flow)).await.unwrap();
    engine.publish(&campaign.id).await.unwrap();

    let parked = session_of(&h, &campaign.id, "c0").await;
    assert_eq!(parked.current_node_id.as_deref(), Some("wait"));
    assert!(parked.wake_at.is_some());
    assert!(engine.timers().is_armed(&parked.id));
    assert_eq!(h.gateway.texts_to("5511900000000"), vec!["Hello"]);

    assert!(settles(&h, &campaign.id, "c0", SessionStatus::Completed).await);
    assert_eq!(h.gateway.texts_to("5511900000000"), vec!["Hello", "Still there?"]);
    let finished = session_of(&h, &campaign.id, "c0").await;
    assert!(finished.wake_at.is_none());
    assert!(!engine.timers().is_armed(&finished.id));
}

#[tokio::test]
async fn test_reply_during_delay_feeds_following_condition() {
    let h = harness().await;
    setup(&h, 1).await;
    let engine = FlowEngine::new(h.state.clone());
    let flow = graph(json!({
        "nodes": [
            {"id": "start", "type": "trigger"},
            {"id": "ask", "type": "text", "data": {"text": "Coupon?"}},
            {"id": "wait", "type": "delay", "data": {"seconds": 1}},
            {"id": "cond", "type": "condition", "data": {"value": "yes"}},
            {"id": "coupon", "type": "text", "data": {"text": "SAVE10"}},
            {"id": "bye", "type": "text", "data": {"text": "Bye"}}
        ],
        "edges": [
            {"source": "start", "target": "ask"},
            {"source": "ask", "target": "wait"},
            {"source": "wait", "target": "cond"},
            {"source": "cond", "target": "coupon", "label": "true"},
            {"source": "cond", "target": "bye", "label": "false"}
        ]
    }));
    let campaign = engine.create(request(flow)).await.unwrap();
    engine.publish(&campaign.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let outcome = engine.process_incoming_message(reply("5511900000000", "yes")).await;
    let session = session_of(&h, &campaign.id, "c0").await;
    assert_eq!(
        outcome,
        InboundOutcome::Advanced {
            session_id: session.id.clone(),
            next_node_id: "wait".to_string(),
        }
    );
    assert!(session.wake_at.is_some());

    assert!(settles(&h, &campaign.id, "c0", SessionStatus::Completed).await);
    assert_eq!(h.gateway.texts_to("5511900000000"), vec!["Coupon?", "SAVE10"]);
}

#[tokio::test]
async fn test_pause_cancels_timers_and_resume_rearms() {
    let h = harness().await;
    setup(&h, 1).await;
    let engine = FlowEngine::new(h.state.clone());
    let flow = graph(json!({
        "nodes": [
            {"id": "start", "type": "trigger"},
            {"id": "wait", "type": "delay", "data": {"seconds": 1}},
            {"id": "later", "type": "text", "data": {"text": "Back again"}}
        ],
        "edges": [
            {"source": "start", "target": "wait"},
            {"source": "wait", "target": "later"}
        ]
    }));
    let campaign = engine.create(request(flow)).await.unwrap();
    engine.publish(&campaign.id).await.unwrap();
    let session = session_of(&h, &campaign.id, "c0").await;
    assert!(engine.timers().is_armed(&session.id));

    let paused = engine.pause(&campaign.id).await.unwrap();
    assert_eq!(paused.status, InteractiveStatus::Paused);
    assert!(!engine.timers().is_armed(&session.id));

    // replies are dropped while paused
    let ignored = engine.process_incoming_message(reply("5511900000000", "hi")).await;
    assert!(!ignored.processed());

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(h.gateway.sent().is_empty());
    let still = session_of(&h, &campaign.id, "c0").await;
    assert_eq!(still.status, SessionStatus::Active);
    assert!(still.wake_at.is_some());

    engine.resume(&campaign.id).await.unwrap();
    assert!(settles(&h, &campaign.id, "c0", SessionStatus::Completed).await);
    assert_eq!(h.gateway.texts_to("5511900000000"), vec!["Back again"]);
}

#[tokio::test]
async fn test_integration_failure_does_not_stop_walk() {
    let h = harness().await;
    setup(&h, 1).await;
    *h.crm.fail.lock().unwrap() = true;
    let engine = FlowEngine::new(h.state.clone());
    let flow = graph(json!({
        "nodes": [
            {"id": "start", "type": "trigger"},
            {"id": "hi", "type": "text", "data": {"text": "Hi"}},
            {"id": "tag", "type": "integration_crm_a", "data": {"action": "add_tag", "payload": {"tag": "lead"}}},
            {"id": "other", "type": "integration_crm_b", "data": {"action": "add_tag"}},
            {"id": "end", "type": "stop"}
        ],
        "edges": [
            {"source": "start", "target": "hi"},
            {"source": "hi", "target": "tag"},
            {"source": "tag", "target": "other"},
            {"source": "other", "target": "end"}
        ]
    }));
    let campaign = engine.create(request(flow)).await.unwrap();
    let report = engine.publish(&campaign.id).await.unwrap();
    assert_eq!(report.started, 1);

    let session = session_of(&h, &campaign.id, "c0").await;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(h.crm.calls(), vec![("5511900000000".to_string(), "add_tag".to_string())]);

    let tag = session.visited.iter().find(|v| v.node_id == "tag").unwrap();
    assert!(!tag.sent);
    assert!(tag.error.as_deref().unwrap().contains("crm unavailable"));
    let other = session.visited.iter().find(|v| v.node_id == "other").unwrap();
    assert!(other.error.as_deref().unwrap().contains("not configured"));
    assert_eq!(session.visited.last().unwrap().node_id, "end");
}

#[tokio::test]
async fn test_unreachable_contact_fails_session() {
    let h = harness().await;
    setup(&h, 2).await;
    h.gateway.mark_unreachable("5511900000001");
    let engine = FlowEngine::new(h.state.clone());
    let campaign = engine.create(request(yes_no_graph())).await.unwrap();

    let report = engine.publish(&campaign.id).await.unwrap();
    assert_eq!(report.started, 1);
    assert_eq!(report.failed, 1);

    let failed = session_of(&h, &campaign.id, "c1").await;
    assert_eq!(failed.status, SessionStatus::Failed);
    assert_eq!(failed.visited.last().unwrap().error.as_deref(), Some(REASON_NOT_REACHABLE));
    assert!(h.gateway.texts_to("5511900000001").is_empty());
}

#[tokio::test]
async fn test_send_failure_fails_session() {
    let h = harness().await;
    setup(&h, 1).await;
    h.gateway.mark_failing("5511900000000");
    let engine = FlowEngine::new(h.state.clone());
    let campaign = engine.create(request(yes_no_graph())).await.unwrap();
    let report = engine.publish(&campaign.id).await.unwrap();
    assert_eq!(report.failed, 1);

    let session = session_of(&h, &campaign.id, "c0").await;
    assert_eq!(session.status, SessionStatus::Failed);
    let ask = session.visited.iter().find(|v| v.node_id == "ask").unwrap();
    assert!(!ask.sent);
    assert!(ask.error.as_deref().unwrap().contains("503"));
}

#[tokio::test]
async fn test_republish_after_pause_skips_existing_sessions() {
    let h = harness().await;
    setup(&h, 2).await;
    let engine = FlowEngine::new(h.state.clone());
    let campaign = engine.create(request(yes_no_graph())).await.unwrap();
    engine.publish(&campaign.id).await.unwrap();
    assert!(matches!(
        engine.publish(&campaign.id).await,
        Err(DispatchError::InvalidTransition { .. })
    ));

    engine.pause(&campaign.id).await.unwrap();
    h.add_contact(&contact("c9", "5511900000009", "Late", &["vip"])).await;
    let again = engine.publish(&campaign.id).await.unwrap();
    assert_eq!(again.contacts, 3);
    assert_eq!(again.skipped, 2);
    assert_eq!(again.started, 1);
    assert_eq!(h.gateway.texts_to("5511900000000").len(), 1);
    assert_eq!(h.gateway.texts_to("5511900000009"), vec!["Hi Late, want a coupon?"]);

    let sessions = db::list_sessions_for_campaign(&h.state.pool, h.state.db_kind, &campaign.id)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 3);
}

#[tokio::test]
async fn test_keyword_trigger_starts_session() {
    let h = harness().await;
    h.add_account("alpha").await;
    let engine = FlowEngine::new(h.state.clone());
    let flow = graph(json!({
        "nodes": [
            {"id": "start", "type": "trigger", "data": {"categories": ["vip"], "keywords": ["promo"]}},
            {"id": "welcome", "type": "text", "data": {"text": "Welcome {{name}}, you said {{last_message}}"}}
        ],
        "edges": [{"source": "start", "target": "welcome"}]
    }));
    let campaign = engine.create(request(flow)).await.unwrap();
    let report = engine.publish(&campaign.id).await.unwrap();
    assert_eq!(report.contacts, 0);

    h.add_contact(&contact("c1", "5511900000001", "Ana", &["vip"])).await;
    h.add_contact(&contact("c2", "5511900000002", "Bia", &["basic"])).await;

    let miss = engine.process_incoming_message(reply("5511900000001", "hello")).await;
    assert!(matches!(miss, InboundOutcome::Ignored { .. }));
    let wrong_category = engine.process_incoming_message(reply("5511900000002", "promo")).await;
    assert!(matches!(wrong_category, InboundOutcome::Ignored { .. }));
    let unknown = engine.process_incoming_message(reply("5511900000099", "promo")).await;
    assert!(matches!(unknown, InboundOutcome::Ignored { .. }));

    let hit = engine.process_incoming_message(reply("5511900000001", "I want the PROMO")).await;
    assert!(matches!(hit, InboundOutcome::Completed { .. }));
    assert_eq!(
        h.gateway.texts_to("5511900000001"),
        vec!["Welcome Ana, you said I want the PROMO"]
    );

    // the contact already has a session, so the trigger does not fire twice
    let again = engine.process_incoming_message(reply("5511900000001", "promo")).await;
    assert!(matches!(again, InboundOutcome::Ignored { .. }));
    assert_eq!(h.gateway.texts_to("5511900000001").len(), 1);
}

#[tokio::test]
async fn test_publish_without_sender_pauses_campaign() {
    let h = harness().await;
    h.add_contact(&contact("c0", "5511900000000", "Name0", &["vip"])).await;
    let engine = FlowEngine::new(h.state.clone());
    let campaign = engine.create(request(yes_no_graph())).await.unwrap();

    let err = engine.publish(&campaign.id).await.unwrap_err();
    assert!(matches!(err, DispatchError::Configuration(_)));
    let stored = db::get_interactive_campaign(&h.state.pool, h.state.db_kind, &campaign.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, InteractiveStatus::Paused);

    h.add_account("alpha").await;
    let report = engine.publish(&campaign.id).await.unwrap();
    assert_eq!(report.started, 1);
}

#[tokio::test]
async fn test_invalid_graph_rejected_at_create() {
    let h = harness().await;
    let engine = FlowEngine::new(h.state.clone());
    let flow = graph(json!({
        "nodes": [{"id": "m", "type": "text", "data": {"text": "x"}}],
        "edges": []
    }));
    assert!(matches!(
        engine.create(request(flow)).await,
        Err(DispatchError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_unmatched_branch_completes_session() {
    let h = harness().await;
    setup(&h, 1).await;
    let engine = FlowEngine::new(h.state.clone());
    let flow = graph(json!({
        "nodes": [
            {"id": "start", "type": "trigger"},
            {"id": "ask", "type": "text", "data": {"text": "Coupon?"}},
            {"id": "cond", "type": "condition", "data": {"value": "yes"}},
            {"id": "coupon", "type": "text", "data": {"text": "SAVE10"}}
        ],
        "edges": [
            {"source": "start", "target": "ask"},
            {"source": "ask", "target": "cond"},
            {"source": "cond", "target": "coupon", "sourceHandle": "yes"}
        ]
    }));
    let campaign = engine.create(request(flow)).await.unwrap();
    engine.publish(&campaign.id).await.unwrap();

    let outcome = engine.process_incoming_message(reply("5511900000000", "no")).await;
    assert!(matches!(outcome, InboundOutcome::Completed { .. }));
    assert_eq!(h.gateway.texts_to("5511900000000"), vec!["Coupon?"]);
    let session = session_of(&h, &campaign.id, "c0").await;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.visited.last().map(|v| v.node_id.as_str()), Some("cond"));
}

#[tokio::test]
async fn test_unbounded_delay_rejected_at_create() {
    let h = harness().await;
    let engine = FlowEngine::new(h.state.clone());
    let flow = graph(json!({
        "nodes": [
            {"id": "start", "type": "trigger"},
            {"id": "wait", "type": "delay", "data": {"seconds": 10_000_000_000_000u64}},
            {"id": "later", "type": "text", "data": {"text": "later"}}
        ],
        "edges": [
            {"source": "start", "target": "wait"},
            {"source": "wait", "target": "later"}
        ]
    }));
    match engine.create(request(flow)).await {
        Err(DispatchError::Configuration(message)) => assert!(message.contains("wait"), "{message}"),
        other => panic!("expected a configuration error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_expiry_sweep_waits_for_walk_in_flight() {
    let h = harness().await;
    setup(&h, 1).await;
    let engine = FlowEngine::new(h.state.clone());
    let campaign = engine.create(request(yes_no_graph())).await.unwrap();
    engine.publish(&campaign.id).await.unwrap();

    h.gateway.set_send_delay(Duration::from_millis(400));
    let walking = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.process_incoming_message(reply("5511900000000", "yes")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // the session looks idle to the sweep but is mid-walk
    let expired = engine
        .expire_idle_sessions(Utc::now() + ChronoDuration::days(8))
        .await
        .unwrap();
    assert_eq!(expired, 0);
    assert!(matches!(walking.await.unwrap(), InboundOutcome::Completed { .. }));

    let session = session_of(&h, &campaign.id, "c0").await;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(h.gateway.texts_to("5511900000000").last().map(String::as_str), Some("Here it is: SAVE10"));
}

#[tokio::test]
async fn test_publish_outside_business_hours_is_deferred() {
    let h = harness().await;
    setup(&h, 1).await;
    let engine = FlowEngine::new(h.state.clone());

    // a one-hour window six hours away from now, every day
    let start_hour = (Utc::now().hour() + 6) % 24;
    let end = if start_hour == 23 {
        "23:59".to_string()
    } else {
        format!("{:02}:00", start_hour + 1)
    };
    let days = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"]
        .iter()
        .map(|day| DaySchedule {
            weekday: day.to_string(),
            enabled: true,
            start: Some(format!("{start_hour:02}:00")),
            end: Some(end.clone()),
            lunch_start: None,
            lunch_end: None,
        })
        .collect();
    let mut req = request(yes_no_graph());
    req.business_hours = Some(BusinessHoursConfig {
        timezone: "UTC".to_string(),
        days,
    });
    let campaign = engine.create(req).await.unwrap();

    let report = engine.publish(&campaign.id).await.unwrap();
    let until = report.deferred_until.unwrap();
    assert!(until > Utc::now());
    assert_eq!(report.started, 0);
    assert!(h.gateway.sent().is_empty());

    let stored = db::get_interactive_campaign(&h.state.pool, h.state.db_kind, &campaign.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, InteractiveStatus::Scheduled);
    assert_eq!(stored.scheduled_at.map(|at| at.timestamp()), Some(until.timestamp()));

    // not due yet
    assert_eq!(engine.publish_due(Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_scheduled_campaign_published_when_due() {
    let h = harness().await;
    setup(&h, 1).await;
    let engine = FlowEngine::new(h.state.clone());
    let mut req = request(yes_no_graph());
    req.scheduled_at = Some(Utc::now() + ChronoDuration::hours(1));
    let campaign = engine.create(req).await.unwrap();
    assert_eq!(campaign.status, InteractiveStatus::Scheduled);

    assert_eq!(engine.publish_due(Utc::now()).await.unwrap(), 0);
    assert_eq!(
        engine
            .publish_due(Utc::now() + ChronoDuration::hours(2))
            .await
            .unwrap(),
        1
    );
    assert_eq!(h.gateway.texts_to("5511900000000").len(), 1);
}

#[tokio::test]
async fn test_idle_sessions_expire() {
    let h = harness().await;
    setup(&h, 1).await;
    let engine = FlowEngine::new(h.state.clone());
    let campaign = engine.create(request(yes_no_graph())).await.unwrap();
    engine.publish(&campaign.id).await.unwrap();

    assert_eq!(engine.expire_idle_sessions(Utc::now()).await.unwrap(), 0);
    let later = Utc::now() + ChronoDuration::days(8);
    assert_eq!(engine.expire_idle_sessions(later).await.unwrap(), 1);

    let session = session_of(&h, &campaign.id, "c0").await;
    assert_eq!(session.status, SessionStatus::Expired);
    let outcome = engine.process_incoming_message(reply("5511900000000", "yes")).await;
    assert!(matches!(outcome, InboundOutcome::Ignored { .. }));
}

#[tokio::test]
async fn test_complete_ends_campaign() {
    let h = harness().await;
    setup(&h, 1).await;
    let engine = FlowEngine::new(h.state.clone());
    let campaign = engine.create(request(yes_no_graph())).await.unwrap();
    assert!(matches!(
        engine.complete(&campaign.id).await,
        Err(DispatchError::InvalidTransition { .. })
    ));
    engine.publish(&campaign.id).await.unwrap();
    let done = engine.complete(&campaign.id).await.unwrap();
    assert_eq!(done.status, InteractiveStatus::Completed);

    let outcome = engine.process_incoming_message(reply("5511900000000", "yes")).await;
    assert!(matches!(outcome, InboundOutcome::Ignored { .. }));
    assert!(matches!(
        engine.resume(&campaign.id).await,
        Err(DispatchError::InvalidTransition { .. })
    ));
}
