use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dyngrant_core_types::{
    Capability, CapabilitySet, ExecutionContext, GrantError, IdentitySet, OriginKey, Principal,
};
use dyngrant_grant_engine::{
    AccessContext, CacheMode, CachingStrategy, EngineConfig, GrantAuthorizer, GrantEngine,
    GrantOutcome,
};
use dyngrant_policy_center::{BasePolicy, PolicyError, PolicyRules, PrincipalRule, StaticPolicy};
use parking_lot::Mutex;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

fn admin_rules() -> PolicyRules {
    PolicyRules {
        principals: vec![PrincipalRule {
            principal: Principal::new("admin"),
            allow: vec![Capability::grant_authority(Capability::All)],
        }],
        ..Default::default()
    }
}

fn context(origin: &str, names: &[&str]) -> Arc<ExecutionContext> {
    ExecutionContext::new(OriginKey::code(origin), IdentitySet::of(names.iter().copied()))
}

fn admin() -> AccessContext {
    AccessContext::single(context("crate://console", &["admin"]))
}

fn engine_with(policy: StaticPolicy) -> GrantEngine {
    let engine = GrantEngine::default();
    engine.attach_base_policy(Arc::new(policy)).unwrap();
    engine
}

fn admin_engine() -> GrantEngine {
    engine_with(StaticPolicy::new(admin_rules()).unwrap())
}

/// Counts base policy queries and delegates to a static rule set.
struct CountingPolicy {
    inner: StaticPolicy,
    queries: AtomicUsize,
}

impl CountingPolicy {
    fn new(inner: StaticPolicy) -> Self {
        Self {
            inner,
            queries: AtomicUsize::new(0),
        }
    }

    fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl BasePolicy for CountingPolicy {
    fn static_capabilities(
        &self,
        origin: &OriginKey,
        identities: &IdentitySet,
    ) -> Result<CapabilitySet, PolicyError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.static_capabilities(origin, identities)
    }

    fn refresh(&self) -> Result<(), PolicyError> {
        self.inner.refresh()
    }

    fn is_dynamic(&self) -> bool {
        self.inner.is_dynamic()
    }
}

struct UnavailablePolicy;

impl BasePolicy for UnavailablePolicy {
    fn static_capabilities(
        &self,
        _origin: &OriginKey,
        _identities: &IdentitySet,
    ) -> Result<CapabilitySet, PolicyError> {
        Err(PolicyError::Unavailable("rule backend offline".into()))
    }

    fn refresh(&self) -> Result<(), PolicyError> {
        Err(PolicyError::Unavailable("rule backend offline".into()))
    }
}

struct AllowAll;

impl GrantAuthorizer for AllowAll {
    fn check_grant(
        &self,
        _engine: &GrantEngine,
        _caller: &AccessContext,
        _requested: &[Capability],
    ) -> Result<(), GrantError> {
        Ok(())
    }
}

#[test]
fn operations_fail_until_base_policy_attached() {
    let engine = GrantEngine::default();
    let ctx = context("crate://a", &[]);
    let token = Capability::read_file("/tmp/x");

    assert!(!engine.is_initialized());
    assert!(matches!(engine.for_context(Some(&ctx)), Err(GrantError::IllegalState(_))));
    assert!(matches!(engine.for_context(None), Err(GrantError::IllegalState(_))));
    assert!(matches!(
        engine.grant(&admin(), None, None, &[token.clone()]),
        Err(GrantError::IllegalState(_))
    ));
    assert!(matches!(engine.get_grants(None, None), Err(GrantError::IllegalState(_))));
    assert!(matches!(engine.implies_context(&ctx, &token), Err(GrantError::IllegalState(_))));
    assert!(matches!(engine.refresh(), Err(GrantError::IllegalState(_))));
    assert!(matches!(engine.caching_strategy(), Err(GrantError::IllegalState(_))));
    assert!(matches!(
        engine.revoke(&admin(), None, None, &[token]),
        Err(GrantError::IllegalState(_))
    ));

    assert!(engine.grant_supported());
    assert!(!engine.revocation_supported());
}

#[test]
fn base_policy_attaches_once() {
    let engine = GrantEngine::default();
    let strategy = engine
        .attach_base_policy(Arc::new(StaticPolicy::empty()))
        .unwrap();
    assert_eq!(strategy, CachingStrategy::Eager);
    assert!(engine.is_initialized());

    let err = engine
        .attach_base_policy(Arc::new(StaticPolicy::empty()))
        .unwrap_err();
    assert!(matches!(err, GrantError::IllegalState(_)));
    assert_eq!(engine.caching_strategy().unwrap(), CachingStrategy::Eager);
}

#[test]
fn caching_strategy_follows_policy_and_config() {
    let dynamic = engine_with(StaticPolicy::dynamic(PolicyRules::default()).unwrap());
    assert_eq!(dynamic.caching_strategy().unwrap(), CachingStrategy::Lazy);

    let forced = GrantEngine::new(EngineConfig {
        cache_mode: CacheMode::Lazy,
        ..EngineConfig::default()
    });
    let strategy = forced
        .attach_base_policy(Arc::new(StaticPolicy::empty()))
        .unwrap();
    assert_eq!(strategy, CachingStrategy::Lazy);
}

#[test]
fn global_grant_reaches_existing_domains() {
    let engine = admin_engine();
    let ctx = context("crate://app", &["alice"]);
    let handle = engine.for_context(Some(&ctx)).unwrap();
    let default_handle = engine.for_context(None).unwrap();
    let token = Capability::read_file("/tmp/x");

    assert!(!engine.implies(&handle, &token).unwrap());
    engine
        .grant(&admin(), None, None, &[token.clone()])
        .unwrap();

    assert!(engine.implies(&handle, &token).unwrap());
    assert!(engine.implies(&default_handle, &token).unwrap());
    assert!(engine.get_grants(None, None).unwrap().implies(&token));
}

#[test]
fn identity_scoped_grant_reaches_supersets_only() {
    let engine = admin_engine();
    let alice = context("crate://app", &["alice"]);
    let both = context("crate://app", &["alice", "bob"]);
    let bob = context("crate://app", &["bob"]);
    let token = Capability::connect("db.internal:5432");

    engine
        .grant(&admin(), None, Some(&IdentitySet::of(["alice"])), &[token.clone()])
        .unwrap();

    assert!(engine.implies_context(&alice, &token).unwrap());
    assert!(engine.implies_context(&both, &token).unwrap());
    assert!(!engine.implies_context(&bob, &token).unwrap());

    let grants = engine
        .get_grants(None, Some(&IdentitySet::of(["alice", "bob"])))
        .unwrap();
    assert!(grants.implies(&token));
    assert!(engine.get_grants(None, None).unwrap().is_empty());
}

#[test]
fn caller_without_authority_is_denied() {
    let engine = admin_engine();
    let intruder = AccessContext::single(context("crate://untrusted", &["mallory"]));
    let err = engine
        .grant(&intruder, None, None, &[Capability::write_file("/etc/passwd")])
        .unwrap_err();
    assert!(matches!(err, GrantError::Security(_)));
    assert!(err.is_denial());
    assert!(engine.get_grants(None, None).unwrap().is_empty());
}

#[test]
fn system_origin_grants_are_unsupported() {
    let engine = admin_engine();
    let err = engine
        .grant(
            &admin(),
            Some(&OriginKey::System),
            None,
            &[Capability::read_file("/tmp/x")],
        )
        .unwrap_err();
    assert!(matches!(err, GrantError::Unsupported(_)));
    assert!(engine.get_grants(None, None).unwrap().is_empty());
    assert!(engine
        .get_grants(Some(&OriginKey::System), None)
        .unwrap()
        .is_empty());
}

#[test]
fn origin_scoped_grant_stays_with_its_origin() {
    let engine = admin_engine();
    let before = context("crate://plugins/reports", &[]);
    let before_handle = engine.for_context(Some(&before)).unwrap();
    let other = context("crate://plugins/export", &[]);
    let origin = OriginKey::code("crate://plugins/reports");
    let token = Capability::read_file("/var/reports/*");

    engine
        .grant(&admin(), Some(&origin), None, &[token.clone()])
        .unwrap();

    assert!(engine.implies(&before_handle, &token).unwrap());
    let after = context("crate://plugins/reports", &["carol"]);
    assert!(engine.implies_context(&after, &Capability::read_file("/var/reports/q3")).unwrap());
    assert!(!engine.implies_context(&other, &token).unwrap());

    assert!(engine.get_grants(Some(&origin), None).unwrap().implies(&token));
    assert!(engine
        .get_grants(Some(&OriginKey::code("crate://plugins/export")), None)
        .unwrap()
        .is_empty());
    assert!(engine.get_grants(None, None).unwrap().is_empty());
    assert!(engine.origin_index(&origin).is_some());
}

#[test]
fn empty_caller_fails_closed() {
    let engine = GrantEngine::default().with_authorizer(Arc::new(AllowAll));
    engine
        .attach_base_policy(Arc::new(StaticPolicy::empty()))
        .unwrap();
    let err = engine
        .grant(&AccessContext::default(), None, None, &[Capability::connect("h:1")])
        .unwrap_err();
    assert!(matches!(err, GrantError::InvalidArgument(_)));
    assert!(engine.get_grants(None, None).unwrap().is_empty());
}

#[test]
fn malformed_request_applies_nothing() {
    let engine = admin_engine();
    let err = engine
        .grant(
            &admin(),
            None,
            None,
            &[Capability::connect("h:1"), Capability::access("socket", " ", ["connect"])],
        )
        .unwrap_err();
    assert!(matches!(err, GrantError::InvalidArgument(_)));

    let err = engine
        .grant(
            &admin(),
            None,
            Some(&IdentitySet::of(["", "alice"])),
            &[Capability::connect("h:1")],
        )
        .unwrap_err();
    assert!(matches!(err, GrantError::InvalidArgument(_)));
    assert!(engine.get_grants(None, None).unwrap().is_empty());
    assert_eq!(engine.global_index().record_count(), 0);
}

#[test]
fn every_caller_frame_must_hold_authority() {
    let rules = PolicyRules {
        principals: vec![
            PrincipalRule {
                principal: Principal::new("admin"),
                allow: vec![Capability::grant_authority(Capability::All)],
            },
            PrincipalRule {
                principal: Principal::new("ops"),
                allow: vec![Capability::grant_authority(Capability::access(
                    "file",
                    "/tmp/*",
                    ["read"],
                ))],
            },
        ],
        ..Default::default()
    };
    let engine = engine_with(StaticPolicy::new(rules).unwrap());
    let ops = context("crate://ops", &["ops"]);
    let ops_caller = AccessContext::single(Arc::clone(&ops));

    engine
        .grant(&ops_caller, None, None, &[Capability::read_file("/tmp/a")])
        .unwrap();

    let err = engine
        .grant(
            &ops_caller,
            None,
            None,
            &[Capability::read_file("/tmp/b"), Capability::write_file("/tmp/b")],
        )
        .unwrap_err();
    assert!(matches!(err, GrantError::Security(_)));
    let grants = engine.get_grants(None, None).unwrap();
    assert!(grants.implies(&Capability::read_file("/tmp/a")));
    assert!(!grants.implies(&Capability::read_file("/tmp/b")));

    let mixed = AccessContext::new(vec![
        context("crate://console", &["admin"]),
        context("crate://guest", &[]),
    ]);
    let err = engine
        .grant(&mixed, None, None, &[Capability::connect("h:1")])
        .unwrap_err();
    assert!(matches!(err, GrantError::Security(_)));
}

#[test]
fn grant_authority_can_itself_be_granted() {
    let engine = admin_engine();
    let deputy = context("crate://deputy", &["deputy"]);
    let delegated = Capability::grant_authority(Capability::connect("h:*"));

    engine
        .grant(&admin(), None, Some(&IdentitySet::of(["deputy"])), &[delegated])
        .unwrap();
    engine
        .grant(
            &AccessContext::single(deputy),
            None,
            None,
            &[Capability::connect("h:1")],
        )
        .unwrap();
    assert!(engine
        .get_grants(None, None)
        .unwrap()
        .implies(&Capability::connect("h:1")));
}

#[test]
fn eager_strategy_caches_until_refresh() {
    let inner = StaticPolicy::new(PolicyRules::default()).unwrap();
    let policy = Arc::new(CountingPolicy::new(inner));
    let engine = GrantEngine::default().with_authorizer(Arc::new(AllowAll));
    engine.attach_base_policy(policy.clone()).unwrap();

    let ctx = context("crate://app", &[]);
    let handle = engine.for_context(Some(&ctx)).unwrap();
    let token = Capability::connect("h:1");
    assert!(!engine.implies(&handle, &token).unwrap());
    assert!(!engine.implies(&handle, &token).unwrap());
    assert_eq!(policy.queries(), 1);

    engine
        .grant(&admin(), None, None, &[Capability::read_file("/g")])
        .unwrap();
    policy
        .inner
        .stage(PolicyRules {
            defaults: vec![token.clone()],
            ..Default::default()
        })
        .unwrap();
    assert!(!engine.implies(&handle, &token).unwrap());

    engine.refresh().unwrap();
    assert!(engine.implies(&handle, &token).unwrap());
    assert_eq!(policy.queries(), 2);
    assert!(engine.implies(&handle, &Capability::read_file("/g")).unwrap());
}

#[test]
fn lazy_strategy_asks_base_policy_every_time() {
    let inner = StaticPolicy::dynamic(PolicyRules::default()).unwrap();
    let policy = Arc::new(CountingPolicy::new(inner));
    let engine = GrantEngine::default();
    assert_eq!(
        engine.attach_base_policy(policy.clone()).unwrap(),
        CachingStrategy::Lazy
    );

    let ctx = context("crate://app", &[]);
    let token = Capability::connect("h:1");
    assert!(!engine.implies_context(&ctx, &token).unwrap());

    policy
        .inner
        .stage(PolicyRules {
            defaults: vec![token.clone()],
            ..Default::default()
        })
        .unwrap();
    assert!(engine.implies_context(&ctx, &token).unwrap());
    assert_eq!(policy.queries(), 2);
}

#[test]
fn base_policy_failures_propagate() {
    let engine = GrantEngine::default();
    engine.attach_base_policy(Arc::new(UnavailablePolicy)).unwrap();
    let ctx = context("crate://app", &[]);

    let err = engine
        .implies_context(&ctx, &Capability::connect("h:1"))
        .unwrap_err();
    assert!(matches!(err, GrantError::BasePolicy(_)));
    assert!(matches!(engine.refresh(), Err(GrantError::BasePolicy(_))));

    // the default authorizer consults the same base policy
    let err = engine
        .grant(&admin(), None, None, &[Capability::connect("h:1")])
        .unwrap_err();
    assert!(matches!(err, GrantError::BasePolicy(_)));
}

#[test]
fn effective_capabilities_union_base_and_grants() {
    let rules = PolicyRules {
        defaults: vec![Capability::read_file("/etc/hosts")],
        ..admin_rules()
    };
    let engine = engine_with(StaticPolicy::new(rules).unwrap());
    let ctx = context("crate://app", &[]);
    let handle = engine.for_context(Some(&ctx)).unwrap();

    engine
        .grant(&admin(), None, None, &[Capability::connect("h:1")])
        .unwrap();
    let effective = engine.effective_capabilities(&handle).unwrap();
    assert_eq!(effective.len(), 2);
    assert!(effective.implies(&Capability::read_file("/etc/hosts")));
    assert!(effective.implies(&Capability::connect("h:1")));
    assert!(handle.has_grants());
}

#[test]
fn revoke_is_never_supported() {
    let engine = admin_engine();
    let err = engine
        .revoke(&admin(), None, None, &[Capability::connect("h:1")])
        .unwrap_err();
    assert!(matches!(err, GrantError::Unsupported(_)));
}

#[test]
fn dropped_contexts_release_their_domains() {
    let engine = GrantEngine::default();
    engine
        .attach_base_policy(Arc::new(StaticPolicy::empty()))
        .unwrap();
    let ctx = context("crate://temp", &["alice"]);
    let handle = engine.for_context(Some(&ctx)).unwrap();
    assert_eq!(engine.live_domains(), 1);
    assert_eq!(engine.global_index().domain_count(), 1);

    drop(handle);
    drop(ctx);
    assert_eq!(engine.live_domains(), 0);
    assert_eq!(engine.global_index().domain_count(), 0);
    assert!(engine
        .origin_index(&OriginKey::code("crate://temp"))
        .is_none());
}

#[test]
fn short_lived_origins_leave_nothing_behind() {
    let engine = GrantEngine::default();
    engine
        .attach_base_policy(Arc::new(StaticPolicy::empty()))
        .unwrap();
    let contexts = (0..1000)
        .map(|i| context(&format!("loader-{i}"), &[]))
        .collect::<Vec<_>>();
    for ctx in &contexts {
        assert!(!engine
            .implies_context(ctx, &Capability::connect("h:1"))
            .unwrap());
    }
    assert_eq!(engine.live_domains(), 1000);

    drop(contexts);
    assert_eq!(engine.live_domains(), 0);
    assert_eq!(engine.global_index().domain_count(), 0);
    assert_eq!(engine.origin_count(), 0);
}

#[test]
fn origin_index_created_by_grant_adopts_live_domains() {
    let engine = admin_engine();
    let origin = OriginKey::code("crate://late");
    let early = context("crate://late", &["alice"]);
    let handle = engine.for_context(Some(&early)).unwrap();
    let unrelated = context("crate://other", &["alice"]);
    engine.for_context(Some(&unrelated)).unwrap();
    assert!(engine.origin_index(&origin).is_none());

    let token = Capability::read_file("/late/*");
    engine
        .grant(&admin(), Some(&origin), Some(&IdentitySet::of(["alice"])), &[token.clone()])
        .unwrap();

    let index = engine.origin_index(&origin).unwrap();
    assert_eq!(index.domain_count(), 1);
    assert!(engine.implies(&handle, &token).unwrap());
    assert!(!engine.implies_context(&unrelated, &token).unwrap());
    assert_eq!(engine.origin_count(), 1);
}

#[derive(Clone, Default)]
struct EventTargets(Arc<Mutex<Vec<String>>>);

impl<S: tracing::Subscriber> Layer<S> for EventTargets {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        self.0.lock().push(event.metadata().target().to_string());
    }
}

#[test]
fn log_events_carry_crate_targets() {
    let targets = EventTargets::default();
    let subscriber = tracing_subscriber::registry().with(targets.clone());
    tracing::subscriber::with_default(subscriber, || {
        let policy = Arc::new(StaticPolicy::dynamic(admin_rules()).unwrap());
        let engine = GrantEngine::default();
        engine.attach_base_policy(policy.clone()).unwrap();
        engine
            .grant(&admin(), None, None, &[Capability::connect("h:1")])
            .unwrap();
        policy.stage(admin_rules()).unwrap();
    });

    let targets = targets.0.lock();
    assert!(targets.iter().any(|target| target == "grant-engine"));
    assert!(targets.iter().any(|target| target == "policy-center"));
    assert!(targets
        .iter()
        .all(|target| target == "grant-engine" || target == "policy-center"));
}

#[tokio::test]
async fn grant_attempts_are_broadcast() {
    let engine = admin_engine();
    let mut events = engine.subscribe();
    let token = Capability::connect("h:1");

    engine
        .grant(&admin(), None, Some(&IdentitySet::of(["alice"])), &[token.clone()])
        .unwrap();
    let intruder = AccessContext::single(context("crate://untrusted", &[]));
    let _ = engine.grant(&intruder, None, None, &[token.clone()]);
    let _ = engine.grant(&admin(), Some(&OriginKey::System), None, &[token]);

    let accepted = events.recv().await.unwrap();
    assert_eq!(accepted.outcome, GrantOutcome::Accepted);
    assert_eq!(accepted.added, 1);
    assert_eq!(accepted.identities, IdentitySet::of(["alice"]));
    assert!(accepted.detail.is_none());

    let denied = events.recv().await.unwrap();
    assert_eq!(denied.outcome, GrantOutcome::Denied);
    assert!(denied.detail.is_some());

    let rejected = events.recv().await.unwrap();
    assert_eq!(rejected.outcome, GrantOutcome::Rejected);
    assert_eq!(rejected.origin, Some(OriginKey::System));
}
