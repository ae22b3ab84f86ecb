//! End-to-end ticket scenarios driven through `TicketService` with a
//! manual clock.

use anyhow::{Context, Result, ensure};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tessera::TicketError;
use tessera::clock::{Clock, ManualClock};
use tessera::registry::{
    LockConfig, LockingTicketRegistry, MemoryTicketStore, TicketRegistry, lock::MemoryLockManager,
};
use tessera::service::TicketService;
use tessera::ticket::{
    Authentication, ExpirationPolicy, PolicySet, Service, TicketFactory, TicketKind,
};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

fn tickets(clock: &ManualClock, policies: PolicySet) -> TicketService {
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let registry = TicketRegistry::new(Arc::new(MemoryTicketStore::new()), Arc::clone(&shared));
    let factory = TicketFactory::new(shared).with_policies(policies);
    TicketService::new(registry, Arc::new(factory))
}

fn app() -> Service {
    Service::new("https://app.example.org")
}

fn advance(clock: &ManualClock, secs: u64) {
    clock.advance(Duration::from_secs(secs));
}

#[tokio::test]
async fn session_idles_out_after_time_to_kill() -> Result<()> {
    let clock = ManualClock::new(Utc::now());
    let tickets = tickets(
        &clock,
        PolicySet::default().with_ticket_granting(ExpirationPolicy::ticket_granting(
            Duration::from_secs(8 * HOUR),
            Duration::from_secs(2 * HOUR),
        )),
    );
    let tgt = tickets
        .create_ticket_granting_ticket(Authentication::new("casuser", clock.now()))
        .await?;

    // Each grant is a use and restarts the idle window.
    advance(&clock, HOUR + 50 * MINUTE);
    tickets.grant_service_ticket(tgt.id(), &app(), false).await?;
    advance(&clock, HOUR + 50 * MINUTE);
    tickets.grant_service_ticket(tgt.id(), &app(), false).await?;

    advance(&clock, 2 * HOUR + MINUTE);
    let idle = tickets.grant_service_ticket(tgt.id(), &app(), false).await;
    ensure!(
        matches!(idle, Err(TicketError::NotFound(_))),
        "idle session still granted tickets: {idle:?}"
    );
    Ok(())
}

#[tokio::test]
async fn active_session_ends_at_max_time_to_live() -> Result<()> {
    let clock = ManualClock::new(Utc::now());
    let tickets = tickets(
        &clock,
        PolicySet::default().with_ticket_granting(ExpirationPolicy::ticket_granting(
            Duration::from_secs(8 * HOUR),
            Duration::from_secs(2 * HOUR),
        )),
    );
    let tgt = tickets
        .create_ticket_granting_ticket(Authentication::new("casuser", clock.now()))
        .await?;

    for _ in 0..7 {
        advance(&clock, HOUR);
        tickets.grant_service_ticket(tgt.id(), &app(), false).await?;
    }

    advance(&clock, HOUR + MINUTE);
    let expired = tickets.grant_service_ticket(tgt.id(), &app(), false).await;
    ensure!(
        matches!(expired, Err(TicketError::NotFound(_))),
        "session outlived its hard limit: {expired:?}"
    );
    Ok(())
}

#[tokio::test]
async fn short_session_idles_out_or_hits_hard_cap() -> Result<()> {
    let clock = ManualClock::new(Utc::now());
    let tickets = tickets(
        &clock,
        PolicySet::default().with_ticket_granting(ExpirationPolicy::ticket_granting(
            Duration::from_secs(2 * HOUR),
            Duration::from_secs(30 * MINUTE),
        )),
    );

    let idle = tickets
        .create_ticket_granting_ticket(Authentication::new("casuser", clock.now()))
        .await?;
    advance(&clock, 31 * MINUTE);
    let result = tickets.grant_service_ticket(idle.id(), &app(), false).await;
    ensure!(
        matches!(result, Err(TicketError::NotFound(_))),
        "idle session survived: {result:?}"
    );

    let busy = tickets
        .create_ticket_granting_ticket(Authentication::new("casuser", clock.now()))
        .await?;
    for _ in 0..23 {
        advance(&clock, 5 * MINUTE);
        tickets.grant_service_ticket(busy.id(), &app(), false).await?;
    }
    advance(&clock, 6 * MINUTE);
    let result = tickets.grant_service_ticket(busy.id(), &app(), false).await;
    ensure!(
        matches!(result, Err(TicketError::NotFound(_))),
        "busy session outlived the hard cap: {result:?}"
    );
    Ok(())
}

#[tokio::test]
async fn service_ticket_is_single_use_within_ten_seconds() -> Result<()> {
    let clock = ManualClock::new(Utc::now());
    let tickets = tickets(
        &clock,
        PolicySet::default()
            .with_service(ExpirationPolicy::multi_use(1, Duration::from_secs(10))),
    );
    let tgt = tickets
        .create_ticket_granting_ticket(Authentication::new("casuser", clock.now()))
        .await?;

    let late = tickets.grant_service_ticket(tgt.id(), &app(), false).await?;
    advance(&clock, 11);
    let result = tickets.validate_service_ticket(late.id(), &app(), None).await;
    ensure!(
        matches!(result, Err(TicketError::NotFound(_))),
        "stale ST validated: {result:?}"
    );

    let st = tickets.grant_service_ticket(tgt.id(), &app(), false).await?;
    advance(&clock, 9);
    let validation = tickets.validate_service_ticket(st.id(), &app(), None).await?;
    ensure!(validation.assertion.principal() == "casuser", "wrong principal");

    let replay = tickets.validate_service_ticket(st.id(), &app(), None).await;
    ensure!(
        matches!(replay, Err(TicketError::NotFound(_))),
        "ST validated twice: {replay:?}"
    );
    Ok(())
}

#[tokio::test]
async fn locked_proxy_flow_and_single_logout() -> Result<()> {
    let clock = ManualClock::new(Utc::now());
    let tickets = tickets(&clock, PolicySet::default());
    let locking = LockingTicketRegistry::new(
        tickets.registry().clone(),
        Arc::new(MemoryLockManager::new()),
        LockConfig::new(),
        "node-a",
    );
    let tickets = tickets.with_locking(locking);

    let tgt = tickets
        .create_ticket_granting_ticket(Authentication::new("casuser", clock.now()))
        .await?;
    let st = tickets.grant_service_ticket(tgt.id(), &app(), true).await?;

    let callback = Service::new("https://app.example.org/pgtCallback");
    let validation = tickets
        .validate_service_ticket(st.id(), &app(), Some(&callback))
        .await?;
    ensure!(validation.assertion.from_new_login, "login flag lost");
    let pgt_id = validation
        .proxy_granting_ticket
        .context("no proxy-granting ticket issued")?;

    let backend = Service::new("https://backend.example.org");
    let pt = tickets.grant_proxy_ticket(&pgt_id, &backend).await?;
    let proxied = tickets.validate_service_ticket(pt.id(), &backend, None).await?;
    ensure!(
        proxied.assertion.proxy_chain == vec![callback.clone()],
        "unexpected proxy chain {:?}",
        proxied.assertion.proxy_chain
    );
    ensure!(proxied.assertion.granted_by == pgt_id, "PT not tied to its PGT");

    let services = tickets.destroy_ticket_granting_ticket(tgt.id()).await?;
    ensure!(
        services == vec![app(), backend.clone()],
        "logout listed {services:?}"
    );

    let after = tickets.grant_proxy_ticket(&pgt_id, &backend).await;
    ensure!(
        matches!(after, Err(TicketError::NotFound(_))),
        "PGT survived logout: {after:?}"
    );
    ensure!(
        tickets.registry().count_tickets().await? == 0,
        "logout left tickets behind"
    );
    Ok(())
}

#[tokio::test]
async fn proxy_tickets_stop_working_when_session_expires() -> Result<()> {
    let clock = ManualClock::new(Utc::now());
    let tickets = tickets(
        &clock,
        PolicySet::default()
            .with_ticket_granting(ExpirationPolicy::ticket_granting(
                Duration::from_secs(100),
                Duration::from_secs(60),
            ))
            .with_proxy(ExpirationPolicy::multi_use(1, Duration::from_secs(200))),
    );
    let tgt = tickets
        .create_ticket_granting_ticket(Authentication::new("casuser", clock.now()))
        .await?;

    advance(&clock, 50);
    let st = tickets.grant_service_ticket(tgt.id(), &app(), false).await?;
    let callback = Service::new("https://app.example.org/pgtCallback");
    let pgt_id = tickets
        .validate_service_ticket(st.id(), &app(), Some(&callback))
        .await?
        .proxy_granting_ticket
        .context("no proxy-granting ticket issued")?;
    let backend = Service::new("https://backend.example.org");
    let pt = tickets.grant_proxy_ticket(&pgt_id, &backend).await?;

    // Past the session's hard limit but not the PGT's own.
    advance(&clock, 55);
    let grant = tickets.grant_proxy_ticket(&pgt_id, &backend).await;
    ensure!(
        matches!(grant, Err(TicketError::NotFound(_))),
        "PGT outlived its session: {grant:?}"
    );
    let validation = tickets.validate_service_ticket(pt.id(), &backend, None).await;
    ensure!(
        matches!(validation, Err(TicketError::NotFound(_))),
        "PT validated after its session expired: {validation:?}"
    );
    Ok(())
}

#[tokio::test]
async fn transient_ticket_round_trip() -> Result<()> {
    let clock = ManualClock::new(Utc::now());
    let tickets = tickets(&clock, PolicySet::default());

    let mut properties = std::collections::BTreeMap::new();
    properties.insert("state".to_string(), serde_json::json!("abc123"));
    let tst = tickets
        .create_transient_ticket(Some(app()), properties)
        .await?;
    ensure!(tst.kind() == TicketKind::TransientSession, "wrong kind");

    let consumed = tickets.consume_transient_ticket(tst.id()).await?;
    ensure!(
        consumed
            .as_transient_session()
            .and_then(|t| t.property("state"))
            == Some(&serde_json::json!("abc123")),
        "property lost"
    );

    let again = tickets.consume_transient_ticket(tst.id()).await;
    ensure!(matches!(again, Err(TicketError::NotFound(_))), "consumed twice");
    Ok(())
}
