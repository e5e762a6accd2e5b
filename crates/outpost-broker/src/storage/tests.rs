//! Storage layer tests for the Outpost broker.

use super::db::BrokerDatabase;
use super::models::*;
use super::queries_nodes::{CheckinParams, NewNode};
use super::queries_tokens::RedeemOutcome;
use super::queries_tunnels::{AllocateTunnelParams, TunnelAllocation};

const T0: i64 = 1_700_000_000;

async fn test_db() -> BrokerDatabase {
    BrokerDatabase::open_in_memory().await.unwrap()
}

fn new_node<'a>(hostname: &'a str, credential_hash: &'a str) -> NewNode<'a> {
    NewNode {
        hostname,
        hardware_fingerprint: None,
        lan_ip: Some("192.168.1.1"),
        wan_ip: None,
        checkin_interval: 300,
        credential_hash,
    }
}

async fn seed_node(db: &BrokerDatabase, hostname: &str) -> Node {
    let hash = format!("hash-{hostname}");
    db.create_node(&new_node(hostname, &hash), T0).await.unwrap()
}

fn alloc(node_id: i64, now: i64, ttl: i64, slots: i64) -> AllocateTunnelParams {
    AllocateTunnelParams {
        node_id,
        port_base: 20_000,
        last_port: 20_000 + 2 * (slots - 1),
        now,
        expires_at: now + ttl,
    }
}

// === Node tests ===

#[tokio::test]
async fn create_and_find_node_by_credential() {
    let db = test_db().await;
    let node = seed_node(&db, "fw-a").await;

    assert_eq!(node.status, NodeStatus::Pending);
    assert_eq!(node.checkin_interval, 300);

    let found = db.find_node_by_credential("hash-fw-a").await.unwrap().unwrap();
    assert_eq!(found.id, node.id);
    assert!(db.find_node_by_credential("other").await.unwrap().is_none());
    assert!(db.get_node(9999).await.is_err());
}

#[tokio::test]
async fn duplicate_credential_is_conflict() {
    let db = test_db().await;
    seed_node(&db, "fw-a").await;
    let err = db
        .create_node(&new_node("fw-b", "hash-fw-a"), T0)
        .await
        .unwrap_err();
    assert!(matches!(err, super::DatabaseError::Conflict(_)));
}

#[tokio::test]
async fn checkin_marks_online_and_keeps_unreported_fields() {
    let db = test_db().await;
    let node = seed_node(&db, "fw-a").await;

    let params = CheckinParams {
        lan_ip: None,
        wan_ip: Some("203.0.113.7"),
        agent_version: Some("2.1.0"),
    };
    let updated = db.record_checkin(node.id, &params, T0 + 10).await.unwrap();

    assert_eq!(updated.status, NodeStatus::Online);
    assert_eq!(updated.last_checkin, Some(T0 + 10));
    assert_eq!(updated.lan_ip.as_deref(), Some("192.168.1.1"));
    assert_eq!(updated.wan_ip.as_deref(), Some("203.0.113.7"));
    assert_eq!(updated.agent_version.as_deref(), Some("2.1.0"));
}

#[tokio::test]
async fn overdue_node_goes_offline_once() {
    let db = test_db().await;
    let node = seed_node(&db, "fw-a").await;
    let params = CheckinParams {
        lan_ip: None,
        wan_ip: None,
        agent_version: None,
    };
    db.record_checkin(node.id, &params, T0).await.unwrap();

    // 3 intervals of 300s: still fine at T0 + 900.
    assert!(db.overdue_online_nodes(T0 + 900, 3).await.unwrap().is_empty());

    let overdue = db.overdue_online_nodes(T0 + 901, 3).await.unwrap();
    assert_eq!(overdue.len(), 1);
    assert!(db.mark_node_offline(node.id, T0 + 901, 3).await.unwrap());
    assert!(!db.mark_node_offline(node.id, T0 + 901, 3).await.unwrap());
    assert_eq!(db.get_node(node.id).await.unwrap().status, NodeStatus::Offline);
}

// === Command tests ===

#[tokio::test]
async fn commands_are_fifo_and_claimed_once() {
    let db = test_db().await;
    let node = seed_node(&db, "fw-a").await;
    let first = db.insert_command(node.id, "ping", T0).await.unwrap();
    let second = db.insert_command(node.id, "restart", T0).await.unwrap();

    let next = db.oldest_pending_command(node.id).await.unwrap().unwrap();
    assert_eq!(next.id, first.id);
    assert!(db.mark_command_sent(first.id, T0 + 1).await.unwrap());
    assert!(!db.mark_command_sent(first.id, T0 + 1).await.unwrap());

    let next = db.oldest_pending_command(node.id).await.unwrap().unwrap();
    assert_eq!(next.id, second.id);
    assert_eq!(db.count_commands(node.id, CommandStatus::Sent).await.unwrap(), 1);
}

#[tokio::test]
async fn finish_command_requires_sent_and_owner() {
    let db = test_db().await;
    let node = seed_node(&db, "fw-a").await;
    let other = seed_node(&db, "fw-b").await;
    let cmd = db.insert_command(node.id, "ping", T0).await.unwrap();

    assert!(
        !db.finish_command(cmd.id, node.id, CommandStatus::Completed, None, T0)
            .await
            .unwrap()
    );
    db.mark_command_sent(cmd.id, T0).await.unwrap();
    assert!(
        !db.finish_command(cmd.id, other.id, CommandStatus::Completed, None, T0)
            .await
            .unwrap()
    );
    assert!(
        db.finish_command(cmd.id, node.id, CommandStatus::Completed, Some("pong"), T0 + 5)
            .await
            .unwrap()
    );

    let cmd = db.get_command(cmd.id).await.unwrap();
    assert_eq!(cmd.status, CommandStatus::Completed);
    assert_eq!(cmd.output.as_deref(), Some("pong"));
    assert_eq!(cmd.completed_at, Some(T0 + 5));
}

// === Update tests ===

#[tokio::test]
async fn latest_pending_update_wins() {
    let db = test_db().await;
    let node = seed_node(&db, "fw-a").await;
    db.insert_update(node.id, "1.0.0", "agent-1.0.0.tar.gz", T0).await.unwrap();
    let newer = db
        .insert_update(node.id, "1.1.0", "agent-1.1.0.tar.gz", T0 + 60)
        .await
        .unwrap();

    let next = db.latest_pending_update(node.id).await.unwrap().unwrap();
    assert_eq!(next.id, newer.id);
}

#[tokio::test]
async fn installed_update_sets_agent_version() {
    let db = test_db().await;
    let node = seed_node(&db, "fw-a").await;
    let update = db.insert_update(node.id, "1.1.0", "agent.tar.gz", T0).await.unwrap();

    assert!(
        !db.finish_update(update.id, node.id, UpdateStatus::Installed, T0)
            .await
            .unwrap()
    );
    assert!(db.mark_update_downloading(update.id, T0 + 1).await.unwrap());
    assert!(
        db.finish_update(update.id, node.id, UpdateStatus::Installed, T0 + 2)
            .await
            .unwrap()
    );

    let node = db.get_node(node.id).await.unwrap();
    assert_eq!(node.agent_version.as_deref(), Some("1.1.0"));
    let update = db.get_update(update.id).await.unwrap();
    assert_eq!(update.status, UpdateStatus::Installed);
    assert_eq!(update.finished_at, Some(T0 + 2));
}

#[tokio::test]
async fn failed_update_leaves_agent_version() {
    let db = test_db().await;
    let node = seed_node(&db, "fw-a").await;
    let update = db.insert_update(node.id, "9.9.9", "agent.tar.gz", T0).await.unwrap();
    db.mark_update_downloading(update.id, T0).await.unwrap();
    db.finish_update(update.id, node.id, UpdateStatus::Failed, T0)
        .await
        .unwrap();
    assert!(db.get_node(node.id).await.unwrap().agent_version.is_none());
}

// === Tunnel tests ===

#[tokio::test]
async fn allocation_takes_lowest_free_slot() {
    let db = test_db().await;
    let a = seed_node(&db, "fw-a").await;
    let b = seed_node(&db, "fw-b").await;

    let (first, _) = db.allocate_tunnel_session(&alloc(a.id, T0, 600, 4)).await.unwrap();
    let TunnelAllocation::Allocated(first) = first else {
        panic!("expected allocation");
    };
    assert_eq!((first.port, first.secondary_port), (20_000, 20_001));

    let (second, _) = db.allocate_tunnel_session(&alloc(b.id, T0, 600, 4)).await.unwrap();
    let TunnelAllocation::Allocated(second) = second else {
        panic!("expected allocation");
    };
    assert_eq!((second.port, second.secondary_port), (20_002, 20_003));
    assert_eq!(db.count_active_tunnels().await.unwrap(), 2);
}

#[tokio::test]
async fn node_with_live_session_is_busy() {
    let db = test_db().await;
    let a = seed_node(&db, "fw-a").await;
    db.allocate_tunnel_session(&alloc(a.id, T0, 600, 4)).await.unwrap();
    let (outcome, _) = db.allocate_tunnel_session(&alloc(a.id, T0, 600, 4)).await.unwrap();
    assert!(matches!(outcome, TunnelAllocation::NodeBusy(s) if s.port == 20_000));
}

#[tokio::test]
async fn exhausted_pool_then_reuse_after_close() {
    let db = test_db().await;
    let a = seed_node(&db, "fw-a").await;
    let b = seed_node(&db, "fw-b").await;

    let (outcome, _) = db.allocate_tunnel_session(&alloc(a.id, T0, 600, 1)).await.unwrap();
    let TunnelAllocation::Allocated(session) = outcome else {
        panic!("expected allocation");
    };
    let (outcome, _) = db.allocate_tunnel_session(&alloc(b.id, T0, 600, 1)).await.unwrap();
    assert!(matches!(outcome, TunnelAllocation::Exhausted));

    assert!(db.close_tunnel_session(session.id, T0 + 5).await.unwrap());
    assert!(!db.close_tunnel_session(session.id, T0 + 6).await.unwrap());

    let (outcome, _) = db.allocate_tunnel_session(&alloc(b.id, T0 + 10, 600, 1)).await.unwrap();
    assert!(matches!(outcome, TunnelAllocation::Allocated(s) if s.port == 20_000));
}

#[tokio::test]
async fn allocation_expires_stale_sessions_first() {
    let db = test_db().await;
    let a = seed_node(&db, "fw-a").await;
    let b = seed_node(&db, "fw-b").await;
    db.allocate_tunnel_session(&alloc(a.id, T0, 600, 1)).await.unwrap();

    let (outcome, expired) = db
        .allocate_tunnel_session(&alloc(b.id, T0 + 600, 600, 1))
        .await
        .unwrap();
    assert!(matches!(outcome, TunnelAllocation::Allocated(s) if s.node_id == b.id));
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].status, TunnelStatus::Expired);
    assert_eq!(expired[0].closed_at, Some(T0 + 600));
}

#[tokio::test]
async fn expire_sessions_moves_only_past_deadline() {
    let db = test_db().await;
    let a = seed_node(&db, "fw-a").await;
    let b = seed_node(&db, "fw-b").await;
    db.allocate_tunnel_session(&alloc(a.id, T0, 100, 4)).await.unwrap();
    db.allocate_tunnel_session(&alloc(b.id, T0, 1000, 4)).await.unwrap();

    let expired = db.expire_tunnel_sessions(T0 + 100).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].node_id, a.id);
    assert!(db.active_tunnel_session(a.id).await.unwrap().is_none());
    assert!(db.active_tunnel_session(b.id).await.unwrap().is_some());
}

// === Request queue tests ===

#[tokio::test]
async fn request_transitions_are_conditional() {
    let db = test_db().await;
    let node = seed_node(&db, "fw-a").await;
    let req = db.insert_request(node.id, 20_000, Some("fetch"), T0).await.unwrap();
    assert_eq!(req.status, RequestStatus::Pending);
    assert_eq!(req.updated_at, T0);

    assert!(
        db.transition_request(req.id, RequestStatus::Pending, RequestStatus::Processing, None, T0 + 1)
            .await
            .unwrap()
    );
    assert!(
        !db.transition_request(req.id, RequestStatus::Pending, RequestStatus::Processing, None, T0 + 1)
            .await
            .unwrap()
    );

    let req = db.get_request(req.id).await.unwrap();
    assert_eq!(req.status, RequestStatus::Processing);
    assert!(req.completed_at.is_none());

    db.transition_request(
        req.id,
        RequestStatus::Processing,
        RequestStatus::Completed,
        Some("ok"),
        T0 + 2,
    )
    .await
    .unwrap();
    let req = db.get_request(req.id).await.unwrap();
    assert_eq!(req.completed_at, Some(T0 + 2));
    assert_eq!(req.result.as_deref(), Some("ok"));
}

#[tokio::test]
async fn stale_requests_excludes_terminal_and_young() {
    let db = test_db().await;
    let node = seed_node(&db, "fw-a").await;
    let old = db.insert_request(node.id, 20_000, None, T0).await.unwrap();
    let done = db.insert_request(node.id, 20_000, None, T0).await.unwrap();
    db.insert_request(node.id, 20_000, None, T0 + 500).await.unwrap();
    db.transition_request(done.id, RequestStatus::Pending, RequestStatus::Failed, None, T0)
        .await
        .unwrap();

    let stale = db.stale_requests(T0 + 1).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, old.id);

    let pending = db.oldest_pending_request(Some(node.id)).await.unwrap().unwrap();
    assert_eq!(pending.id, old.id);
    assert!(db.oldest_pending_request(Some(9999)).await.unwrap().is_none());
}

#[tokio::test]
async fn time_out_reports_the_status_it_replaced() {
    let db = test_db().await;
    let node = seed_node(&db, "fw-a").await;
    let pending = db.insert_request(node.id, 20_000, None, T0).await.unwrap();
    let claimed = db.insert_request(node.id, 20_000, None, T0).await.unwrap();
    let done = db.insert_request(node.id, 20_000, None, T0).await.unwrap();
    db.transition_request(claimed.id, RequestStatus::Pending, RequestStatus::Processing, None, T0)
        .await
        .unwrap();
    db.transition_request(done.id, RequestStatus::Pending, RequestStatus::Failed, None, T0)
        .await
        .unwrap();

    assert_eq!(
        db.time_out_request(pending.id, T0 + 900).await.unwrap(),
        Some(RequestStatus::Pending)
    );
    assert_eq!(
        db.time_out_request(claimed.id, T0 + 900).await.unwrap(),
        Some(RequestStatus::Processing)
    );
    assert_eq!(db.time_out_request(done.id, T0 + 900).await.unwrap(), None);
    assert_eq!(db.time_out_request(pending.id, T0 + 901).await.unwrap(), None);
    assert_eq!(
        db.get_request(claimed.id).await.unwrap().completed_at,
        Some(T0 + 900)
    );
}

// === Enrollment token tests ===

#[tokio::test]
async fn redeem_creates_node_and_consumes_token() {
    let db = test_db().await;
    db.insert_token("tok", T0 + 3600, T0).await.unwrap();
    assert_eq!(db.count_active_tokens(T0).await.unwrap(), 1);

    let outcome = db
        .redeem_enrollment_token("tok", &new_node("fw-a", "cred-a"), T0 + 10)
        .await
        .unwrap();
    let RedeemOutcome::Redeemed(node) = outcome else {
        panic!("expected redemption");
    };
    assert_eq!(node.hostname, "fw-a");

    let token = db.get_token("tok").await.unwrap();
    assert_eq!(token.used, 1);
    assert_eq!(token.used_at, Some(T0 + 10));
    assert_eq!(token.node_id, Some(node.id));
    assert_eq!(db.count_active_tokens(T0 + 10).await.unwrap(), 0);

    let again = db
        .redeem_enrollment_token("tok", &new_node("fw-b", "cred-b"), T0 + 11)
        .await
        .unwrap();
    assert!(matches!(again, RedeemOutcome::AlreadyUsed));
    assert_eq!(db.list_nodes().await.unwrap().len(), 1);
}

#[tokio::test]
async fn redeem_rejects_expired_and_unknown() {
    let db = test_db().await;
    db.insert_token("tok", T0 + 60, T0).await.unwrap();

    let outcome = db
        .redeem_enrollment_token("tok", &new_node("fw-a", "cred-a"), T0 + 60)
        .await
        .unwrap();
    assert!(matches!(outcome, RedeemOutcome::Expired));

    let outcome = db
        .redeem_enrollment_token("nope", &new_node("fw-a", "cred-a"), T0)
        .await
        .unwrap();
    assert!(matches!(outcome, RedeemOutcome::NotFound));
    assert!(db.list_nodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn purge_drops_only_expired_unused_tokens() {
    let db = test_db().await;
    db.insert_token("old", T0 + 10, T0).await.unwrap();
    db.insert_token("fresh", T0 + 1000, T0).await.unwrap();
    db.insert_token("used", T0 + 10, T0).await.unwrap();
    db.redeem_enrollment_token("used", &new_node("fw-a", "cred-a"), T0 + 1)
        .await
        .unwrap();

    assert_eq!(db.purge_expired_tokens(T0 + 10).await.unwrap(), 1);
    assert!(db.get_token("old").await.is_err());
    assert!(db.get_token("fresh").await.is_ok());
    assert!(db.get_token("used").await.is_ok());
}

// === Audit tests ===

#[tokio::test]
async fn audit_records_filter_by_category() {
    let db = test_db().await;
    db.insert_audit("proxy", "Request 1 timed out", "{}", None, T0)
        .await
        .unwrap();
    db.insert_audit("tunnel", "Session 1 expired", "{}", None, T0)
        .await
        .unwrap();

    let proxy = db.list_audit(Some("proxy"), 10).await.unwrap();
    assert_eq!(proxy.len(), 1);
    assert_eq!(proxy[0].message, "Request 1 timed out");
    assert_eq!(db.list_audit(None, 10).await.unwrap().len(), 2);
}
