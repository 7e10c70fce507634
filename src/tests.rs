//! End-to-end pipeline scenarios
//!
//! Drives the staged pipeline over the in-memory repository, the in-process
//! fabric, and the replay connector: sync -> process -> link -> analyze ->
//! alerts, asserting the seeded posture outcomes and the lifecycle laws.

#[cfg(test)]
mod tests {
    use crate::adapter::AdapterRuntime;
    use crate::alerts::AlertManager;
    use crate::analyzer::run_all;
    use crate::config::PipelineConfig;
    use crate::connectors::replay::{ReplayConnector, ReplayFactory};
    use crate::connectors::{ConnectorError, ConnectorRegistry, IntegrationCapability, LinkRules, RawObject};
    use crate::context::ContextLoader;
    use crate::events::{
        sync_queue, FetchedEvent, ProcessedEvent, SyncJobPayload, UnifiedAnalysisEvent,
    };
    use crate::fabric::memory::InProcessFabric;
    use crate::fabric::{QueueMessage, TopicBus, TopicSubscription, WorkQueue};
    use crate::linker::Linker;
    use crate::processor::EntityProcessor;
    use crate::repository::memory::MemoryRepository;
    use crate::repository::{
        AlertIndex, AlertStore, DataSourceStore, EntityIndex, EntityStore, IntegrationStore,
        JobStore, TenantStore,
    };
    use crate::scheduler::Scheduler;
    use crate::types::*;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    const SLUG: &str = "microsoft-365";
    const DAY_MS: i64 = 86_400_000;

    struct Harness {
        repo: Arc<MemoryRepository>,
        fabric: Arc<InProcessFabric>,
        connector: Arc<ReplayConnector>,
        scheduler: Arc<Scheduler>,
        adapter: AdapterRuntime,
        processor: EntityProcessor,
        linker: Linker,
        alert_manager: AlertManager,
        loader: ContextLoader,
        fetched_sub: TopicSubscription,
        processed_sub: TopicSubscription,
        sync_counter: u32,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_connector(Arc::new(ReplayConnector::new(SLUG))).await
        }

        async fn with_connector(connector: Arc<ReplayConnector>) -> Self {
            let repo = Arc::new(MemoryRepository::new());
            let fabric = Arc::new(InProcessFabric::new());
            let mut registry = ConnectorRegistry::new();
            registry.register(IntegrationCapability {
                slug: SLUG.to_string(),
                connector: Arc::new(ReplayFactory::new(connector.clone())),
                link_rules: LinkRules::directory(),
                analyses: AnalysisType::all(),
            });
            let registry = Arc::new(registry);
            let config = PipelineConfig::default();

            let scheduler = Arc::new(Scheduler::new(repo.clone(), fabric.clone(), config.clone()));
            let adapter = AdapterRuntime::new(
                repo.clone(),
                fabric.clone(),
                fabric.clone(),
                registry.clone(),
                scheduler.clone(),
                config,
            );
            let processor = EntityProcessor::new(repo.clone(), fabric.clone());
            let linker = Linker::new(repo.clone(), fabric.clone(), registry.clone());
            let alert_manager = AlertManager::new(repo.clone());
            let loader = ContextLoader::new(repo.clone());

            let fetched_sub = fabric.subscribe("fetched.*").await.unwrap();
            let processed_sub = fabric.subscribe("processed.*").await.unwrap();

            let harness = Self {
                repo,
                fabric,
                connector,
                scheduler,
                adapter,
                processor,
                linker,
                alert_manager,
                loader,
                fetched_sub,
                processed_sub,
                sync_counter: 0,
            };
            harness.seed_catalog().await;
            harness
        }

        async fn seed_catalog(&self) {
            self.repo
                .upsert_tenant(&Tenant::new("t-1", "Acme MSP"))
                .await
                .unwrap();
            let mut supported = Vec::new();
            for entity_type in [
                EntityType::Identities,
                EntityType::Groups,
                EntityType::Roles,
                EntityType::Policies,
                EntityType::Licenses,
            ] {
                supported.push(SupportedType::new(entity_type));
            }
            self.repo
                .upsert_integration(&Integration {
                    id: "int-m365".to_string(),
                    slug: SLUG.to_string(),
                    name: "Microsoft 365".to_string(),
                    category: "identity".to_string(),
                    supported_types: supported,
                    updated_at: now_ms(),
                })
                .await
                .unwrap();
            self.repo
                .upsert_data_source(&DataSource {
                    id: "ds-1".to_string(),
                    tenant_id: "t-1".to_string(),
                    site_id: None,
                    integration_id: "int-m365".to_string(),
                    integration_slug: SLUG.to_string(),
                    config: DataSourceConfig::default(),
                    is_primary: true,
                    status: DataSourceStatus::Active,
                    credential_expiration_at: None,
                    last_sync_at: None,
                    current_sync_id: None,
                    last_success_at: Default::default(),
                    last_error: None,
                    updated_at: now_ms(),
                    deleted_at: None,
                })
                .await
                .unwrap();
        }

        /// Drive one sync of one entity type through the adapter, including
        /// any continuation batches it enqueues.
        async fn sync_type(&mut self, entity_type: EntityType) {
            self.sync_counter += 1;
            let sync_id = format!("sync-{}-{}", entity_type.as_str(), self.sync_counter);
            let job_id = Uuid::new_v4().to_string();
            let payload = SyncJobPayload {
                sync_id,
                job_id: job_id.clone(),
                tenant_id: "t-1".to_string(),
                integration_slug: SLUG.to_string(),
                integration_id: "int-m365".to_string(),
                data_source_id: "ds-1".to_string(),
                action: entity_type.sync_action(),
                entity_type,
                priority: 5,
                cursor: None,
                batch_number: 0,
                started_at: now_ms(),
            };
            self.repo
                .upsert_job(&ScheduledJob {
                    id: job_id,
                    tenant_id: "t-1".to_string(),
                    integration_id: "int-m365".to_string(),
                    integration_slug: SLUG.to_string(),
                    data_source_id: "ds-1".to_string(),
                    action: entity_type.sync_action(),
                    payload: serde_json::to_value(&payload).unwrap(),
                    priority: 5,
                    status: JobStatus::Pending,
                    attempts: 0,
                    attempts_max: 5,
                    scheduled_at: now_ms(),
                    started_at: None,
                    next_retry_at: None,
                    error: None,
                    updated_at: now_ms(),
                    deleted_at: None,
                })
                .await
                .unwrap();

            let message = QueueMessage {
                id: Uuid::new_v4().to_string(),
                queue: sync_queue(SLUG, entity_type),
                payload: serde_json::to_value(&payload).unwrap(),
                priority: 5,
                attempts: 0,
                data_source_id: Some("ds-1".to_string()),
                action: Some(entity_type.sync_action()),
                enqueued_at: now_ms(),
                available_at: now_ms(),
            };
            self.adapter.handle_message(&message).await.unwrap();

            // Continuation batches land on the real queue with no delay; the
            // self-scheduled next sync is rate-limited an hour out and stays
            // put.
            let queue_name = sync_queue(SLUG, entity_type);
            while let Some(next) = self.fabric.dequeue(&queue_name, 10).await.unwrap() {
                self.adapter.handle_message(&next).await.unwrap();
                self.fabric.ack(&queue_name, &next.id).await.unwrap();
            }
        }

        fn drain_fetched(&mut self) -> Vec<FetchedEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.fetched_sub.receiver.try_recv() {
                events.push(serde_json::from_value(event.payload).unwrap());
            }
            events
        }

        fn drain_processed(&mut self) -> Vec<ProcessedEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.processed_sub.receiver.try_recv() {
                events.push(serde_json::from_value(event.payload).unwrap());
            }
            events
        }

        /// One full pass: sync all types, process, link, analyze, reconcile.
        async fn run_pipeline(&mut self) -> UnifiedAnalysisEvent {
            for entity_type in [
                EntityType::Identities,
                EntityType::Groups,
                EntityType::Roles,
                EntityType::Policies,
                EntityType::Licenses,
            ] {
                self.sync_type(entity_type).await;
            }
            for fetched in self.drain_fetched() {
                self.processor.handle_fetched(&fetched).await.unwrap();
            }
            for processed in self.drain_processed() {
                self.linker.handle_processed(&processed).await.unwrap();
            }
            let context = self.loader.load("t-1", "ds-1", SLUG).await.unwrap();
            let event = run_all(&context, &format!("run-{}", self.sync_counter));
            self.alert_manager.handle_analysis(&event).await.unwrap();
            event
        }

        async fn entity_by_external(&self, external_id: &str) -> Entity {
            self.repo
                .list_entities(EntityIndex::ByExternalId {
                    data_source_id: "ds-1",
                    external_id,
                })
                .await
                .unwrap()
                .into_iter()
                .next()
                .unwrap_or_else(|| panic!("no entity for {}", external_id))
        }

        async fn active_alerts(&self, entity_id: &str) -> Vec<EntityAlert> {
            self.repo
                .list_alerts(AlertIndex::ByEntityStatus {
                    entity_id,
                    status: AlertStatus::Active,
                })
                .await
                .unwrap()
        }
    }

    fn identity_record(
        external_id: &str,
        display_name: &str,
        enabled: bool,
        last_login_at: Option<i64>,
        license_sku_ids: &[&str],
    ) -> RawObject {
        RawObject {
            external_id: external_id.to_string(),
            raw_data: json!({
                "id": external_id,
                "displayName": display_name,
                "accountEnabled": enabled,
            }),
            normalized_data: json!({
                "display_name": display_name,
                "user_principal_name": format!("{}@contoso.com", external_id),
                "enabled": enabled,
                "last_login_at": last_login_at,
                "license_sku_ids": license_sku_ids,
                "group_external_ids": [],
            }),
        }
    }

    fn role_record(external_id: &str, display_name: &str, members: &[&str]) -> RawObject {
        RawObject {
            external_id: external_id.to_string(),
            raw_data: json!({"id": external_id, "displayName": display_name}),
            normalized_data: json!({
                "display_name": display_name,
                "member_external_ids": members,
            }),
        }
    }

    fn license_record(sku_id: &str, part_number: &str, total: i64, consumed: i64) -> RawObject {
        RawObject {
            external_id: sku_id.to_string(),
            raw_data: json!({
                "skuId": sku_id,
                "skuPartNumber": part_number,
                "prepaidUnits": {"enabled": total},
                "consumedUnits": consumed,
            }),
            normalized_data: json!({
                "sku_id": sku_id,
                "sku_part_number": part_number,
                "total_units": total,
                "consumed_units": consumed,
            }),
        }
    }

    fn ca_policy_record(external_id: &str, include_users: &[&str], apps_all: bool) -> RawObject {
        let include_applications = if apps_all { vec!["All"] } else { vec!["app-1"] };
        RawObject {
            external_id: external_id.to_string(),
            raw_data: json!({"id": external_id}),
            normalized_data: json!({
                "policy_kind": "conditional_access",
                "display_name": external_id,
                "state": "enabled",
                "mfa_required": true,
                "include_users": include_users,
                "exclude_users": [],
                "include_groups": [],
                "exclude_groups": [],
                "include_applications": include_applications,
            }),
        }
    }

    /// Seeding scenario: three identities under Security Defaults, no CA
    /// policies. The admin is fully covered; both members are partially
    /// covered.
    #[tokio::test]
    async fn seeding_scenario_produces_expected_alerts_and_states() {
        let mut harness = Harness::new().await;
        let now = now_ms();
        harness.connector.set_records(
            EntityType::Identities,
            vec![
                identity_record("admin", "Avery Admin", true, Some(now), &[]),
                identity_record("member-1", "Mia Member", true, Some(now), &[]),
                identity_record("member-2", "Max Member", true, Some(now), &[]),
            ],
        );
        harness.connector.set_records(
            EntityType::Roles,
            vec![role_record("role-ga", "Global Administrator", &["admin"])],
        );
        harness.connector.set_security_defaults(true);

        harness.run_pipeline().await;

        let identities = harness
            .repo
            .list_entities(EntityIndex::ByDataSourceType {
                data_source_id: "ds-1",
                entity_type: EntityType::Identities,
            })
            .await
            .unwrap();
        assert_eq!(identities.len(), 3);

        let admin = harness.entity_by_external("admin").await;
        assert_eq!(admin.state, EntityState::Normal);
        assert!(harness.active_alerts(&admin.id).await.is_empty());
        assert!(admin.tags.contains(&"Admin".to_string()));

        for member in ["member-1", "member-2"] {
            let entity = harness.entity_by_external(member).await;
            assert_eq!(entity.state, EntityState::Warn);
            let alerts = harness.active_alerts(&entity.id).await;
            assert_eq!(alerts.len(), 1);
            assert_eq!(alerts[0].severity, Severity::Medium);
            assert_eq!(
                alerts[0].fingerprint,
                format!("mfa_partial_enforced:{}", entity.id)
            );
        }
    }

    /// Policy added: an all-users all-apps MFA policy resolves the partial
    /// alerts without creating anything new.
    #[tokio::test]
    async fn adding_a_full_mfa_policy_resolves_partial_alerts() {
        let mut harness = Harness::new().await;
        let now = now_ms();
        harness.connector.set_records(
            EntityType::Identities,
            vec![
                identity_record("member-1", "Mia Member", true, Some(now), &[]),
                identity_record("member-2", "Max Member", true, Some(now), &[]),
            ],
        );
        harness.connector.set_security_defaults(true);
        harness.run_pipeline().await;

        harness.connector.set_records(
            EntityType::Policies,
            vec![ca_policy_record("pol-mfa-all", &["All"], true)],
        );
        let event = harness.run_pipeline().await;
        assert_eq!(event.stats.findings_total, 0);

        for member in ["member-1", "member-2"] {
            let entity = harness.entity_by_external(member).await;
            assert!(harness.active_alerts(&entity.id).await.is_empty());
            assert_eq!(entity.state, EntityState::Normal);
            let resolved = harness
                .repo
                .list_alerts(AlertIndex::ByEntityStatus {
                    entity_id: &entity.id,
                    status: AlertStatus::Resolved,
                })
                .await
                .unwrap();
            assert_eq!(resolved.len(), 1);
            assert!(resolved[0].resolved_at.is_some());
        }
    }

    /// License waste: a disabled member still holding a license.
    #[tokio::test]
    async fn disabling_a_licensed_member_emits_license_waste() {
        let mut harness = Harness::new().await;
        let now = now_ms();
        harness.connector.set_records(
            EntityType::Identities,
            vec![identity_record("member-1", "Mia Member", true, Some(now), &["sku-e3"])],
        );
        harness.connector.set_records(
            EntityType::Licenses,
            vec![license_record("sku-e3", "SPE_E3", 10, 1)],
        );
        harness.connector.set_security_defaults(true);
        harness.run_pipeline().await;

        harness.connector.set_records(
            EntityType::Identities,
            vec![identity_record("member-1", "Mia Member", false, Some(now), &["sku-e3"])],
        );
        harness.run_pipeline().await;

        let entity = harness.entity_by_external("member-1").await;
        let alerts = harness.active_alerts(&entity.id).await;
        let waste: Vec<_> = alerts
            .iter()
            .filter(|a| a.alert_type == AnalysisType::LicenseWaste)
            .collect();
        assert_eq!(waste.len(), 1);
        assert_eq!(waste[0].severity, Severity::Medium);
        assert_eq!(
            waste[0].fingerprint,
            format!("license_waste:{}:sku-e3", entity.id)
        );
    }

    /// Stale identity holding a license: stale_user medium plus waste low.
    #[tokio::test]
    async fn stale_licensed_identity_emits_both_findings() {
        let mut harness = Harness::new().await;
        let now = now_ms();
        harness.connector.set_records(
            EntityType::Identities,
            vec![identity_record(
                "member-1",
                "Mia Member",
                true,
                Some(now - 120 * DAY_MS),
                &["sku-e5"],
            )],
        );
        harness.connector.set_records(
            EntityType::Licenses,
            vec![license_record("sku-e5", "SPE_E5", 5, 1)],
        );
        harness.connector.set_security_defaults(true);
        harness.run_pipeline().await;

        let entity = harness.entity_by_external("member-1").await;
        let alerts = harness.active_alerts(&entity.id).await;
        let stale = alerts
            .iter()
            .find(|a| a.alert_type == AnalysisType::StaleUser)
            .expect("stale_user alert");
        assert_eq!(stale.severity, Severity::Medium);
        let waste = alerts
            .iter()
            .find(|a| a.alert_type == AnalysisType::LicenseWaste)
            .expect("license_waste alert");
        assert_eq!(waste.severity, Severity::Low);
        assert!(entity.tags.contains(&"Stale".to_string()));
    }

    /// Overuse: consumed beyond total is high severity.
    #[tokio::test]
    async fn oversubscribed_license_pool_is_flagged() {
        let mut harness = Harness::new().await;
        harness.connector.set_records(
            EntityType::Licenses,
            vec![
                license_record("sku-e3", "SPE_E3", 10, 12),
                license_record("sku-free", "FLOW_FREE", 0, 0),
            ],
        );
        harness.run_pipeline().await;

        let license = harness.entity_by_external("sku-e3").await;
        let alerts = harness.active_alerts(&license.id).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AnalysisType::LicenseOveruse);
        assert_eq!(alerts[0].severity, Severity::High);

        let zero = harness.entity_by_external("sku-free").await;
        assert!(harness.active_alerts(&zero.id).await.is_empty());
    }

    /// Mark-and-sweep across syncs: an identity the vendor stops returning
    /// is soft-deleted within one sync and its alerts resolve.
    #[tokio::test]
    async fn vanished_identities_are_swept_and_their_alerts_resolve() {
        let mut harness = Harness::new().await;
        let now = now_ms();
        harness.connector.set_records(
            EntityType::Identities,
            vec![
                identity_record("member-1", "Mia Member", true, Some(now), &[]),
                identity_record("member-2", "Max Member", true, Some(now), &[]),
            ],
        );
        harness.run_pipeline().await;
        let member2 = harness.entity_by_external("member-2").await;
        assert_eq!(harness.active_alerts(&member2.id).await.len(), 1);

        harness.connector.set_records(
            EntityType::Identities,
            vec![identity_record("member-1", "Mia Member", true, Some(now), &[])],
        );
        harness.run_pipeline().await;

        let member2 = harness.entity_by_external("member-2").await;
        assert!(member2.deleted_at.is_some());
        // Swept identities drop out of the context, so their findings vanish
        // and the explicit-resolution pass closes the alerts.
        assert!(harness.active_alerts(&member2.id).await.is_empty());
    }

    /// Pagination: batches share one sync id and only the final batch
    /// sweeps.
    #[tokio::test]
    async fn paginated_syncs_share_a_sync_id_and_sweep_once() {
        let connector = Arc::new(ReplayConnector::with_page_size(SLUG, 2));
        let mut harness = Harness::with_connector(connector.clone()).await;
        let now = now_ms();
        connector.set_records(
            EntityType::Identities,
            (0..5)
                .map(|i| identity_record(&format!("u-{}", i), "User", true, Some(now), &[]))
                .collect(),
        );

        harness.sync_type(EntityType::Identities).await;
        let fetched = harness.drain_fetched();
        assert_eq!(fetched.len(), 3);
        let sync_ids: std::collections::HashSet<_> =
            fetched.iter().map(|f| f.sync_id.clone()).collect();
        assert_eq!(sync_ids.len(), 1);
        assert!(fetched[0].has_more);
        assert!(!fetched[2].has_more);

        for event in &fetched {
            harness.processor.handle_fetched(event).await.unwrap();
        }
        let identities = harness
            .repo
            .list_entities(EntityIndex::ByDataSourceType {
                data_source_id: "ds-1",
                entity_type: EntityType::Identities,
            })
            .await
            .unwrap();
        assert_eq!(identities.len(), 5);
        assert!(identities.iter().all(|e| e.deleted_at.is_none()));
    }

    /// Scheduler-driven path: a tick enqueues due jobs the adapter can
    /// consume, and sync completion records bookkeeping on the data source.
    #[tokio::test]
    async fn scheduler_tick_drives_a_sync_end_to_end() {
        let mut harness = Harness::new().await;
        let now = now_ms();
        harness.connector.set_records(
            EntityType::Identities,
            vec![identity_record("member-1", "Mia Member", true, Some(now), &[])],
        );

        let stats = harness.scheduler.tick().await.unwrap();
        assert_eq!(stats.jobs_created, 5);

        let queue_name = sync_queue(SLUG, EntityType::Identities);
        let message = harness.fabric.dequeue(&queue_name, 50).await.unwrap().unwrap();
        harness.adapter.handle_message(&message).await.unwrap();
        harness.fabric.ack(&queue_name, &message.id).await.unwrap();

        let ds = harness.repo.get_data_source("ds-1").await.unwrap().unwrap();
        assert!(ds.last_success_at.contains_key("identities"));
        assert!(ds.current_sync_id.is_none());
        assert!(ds.last_sync_at.is_some());

        let payload: SyncJobPayload = serde_json::from_value(message.payload).unwrap();
        let job = harness.repo.get_job(&payload.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    /// Credential failures stop the sync and surface on the data source.
    #[tokio::test]
    async fn credential_failures_mark_the_data_source() {
        let mut harness = Harness::new().await;
        harness
            .connector
            .fail_next(1, ConnectorError::credential("token revoked"));

        harness.sync_type(EntityType::Identities).await;

        let ds = harness.repo.get_data_source("ds-1").await.unwrap().unwrap();
        assert_eq!(ds.status, DataSourceStatus::Error);
        assert!(ds.last_error.as_deref().unwrap_or_default().contains("token revoked"));
    }
}
