#[cfg(test)]
mod tests {
    use serde_json::json;
    use warden_core::*;

    // ── Run state machine ──────────────────────────────────────

    #[test]
    fn test_allowed_transitions() {
        use RunStatus::*;
        assert!(Queued.can_transition_to(Approved));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Approved.can_transition_to(Running));
        assert!(Approved.can_transition_to(Cancelled));
        for terminal in [Succeeded, Failed, RolledBack, Cancelled] {
            assert!(Running.can_transition_to(terminal));
        }
    }

    #[test]
    fn test_forbidden_transitions() {
        use RunStatus::*;
        assert!(!Queued.can_transition_to(Running));
        assert!(!Approved.can_transition_to(Queued));
        assert!(!Running.can_transition_to(Approved));
        for terminal in [Succeeded, Failed, RolledBack, Cancelled] {
            for next in RunStatus::ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in RunStatus::ALL {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert_eq!(RunStatus::parse("paused"), None);
    }

    #[test]
    fn test_in_flight_statuses() {
        assert!(RunStatus::Queued.is_in_flight());
        assert!(RunStatus::Running.is_in_flight());
        assert!(!RunStatus::RolledBack.is_in_flight());
        assert!(RunStatus::RolledBack.is_terminal());
    }

    // ── Scope ──────────────────────────────────────────────────

    #[test]
    fn test_entity_count_sums_id_lists() {
        let scope = RunScope::from_value(json!({
            "entity_ids": [1, 2, 3],
            "invoice_ids": [10, 11],
            "currency": "EUR"
        }));
        assert_eq!(scope.entity_count(), 5);
    }

    #[test]
    fn test_entity_count_unstructured_is_one() {
        let scope = RunScope::from_value(json!({"region": "emea"}));
        assert_eq!(scope.entity_count(), 1);
        assert_eq!(RunScope::from_value(json!("free text")).entity_count(), 1);
    }

    #[test]
    fn test_sampled_scope_truncates_and_flags() {
        let ids: Vec<u32> = (1..=200).collect();
        let scope = RunScope::from_value(json!({"entity_ids": ids, "total_entities": 1000}));
        let canary = scope.sampled(20);
        assert!(canary.is_canary());
        assert_eq!(canary.entity_count(), 20);
        assert_eq!(canary.lookup("entity_ids.0"), Some(&json!(1)));
        assert_eq!(canary.total_entities(), Some(1000));
        assert!(!scope.is_canary());
    }

    #[test]
    fn test_sampled_scope_splits_budget_across_lists() {
        let customers: Vec<u32> = (1..=100).collect();
        let invoices: Vec<u32> = (501..=600).collect();
        let scope = RunScope::from_value(json!({"customer_ids": customers, "invoice_ids": invoices}));
        assert_eq!(scope.entity_count(), 200);

        let canary = scope.sampled(20);
        assert_eq!(canary.entity_count(), 20);
        assert_eq!(canary.lookup("customer_ids.19"), Some(&json!(20)));
        assert_eq!(canary.lookup("invoice_ids"), Some(&json!([])));

        let straddling = scope.sampled(105);
        assert_eq!(straddling.entity_count(), 105);
        assert_eq!(straddling.lookup("invoice_ids.4"), Some(&json!(505)));
        assert_eq!(straddling.lookup("invoice_ids.5"), None);
    }

    #[test]
    fn test_scope_lookup_nested() {
        let scope = RunScope::from_value(json!({"customer": {"region": "emea", "tier": 2}}));
        assert_eq!(scope.lookup("customer.region"), Some(&json!("emea")));
        assert_eq!(scope.lookup("customer.missing"), None);
        assert_eq!(scope.lookup("nothing"), None);
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = RunScope::from_value(json!({"a": 1, "b": [1, 2]}));
        let b = RunScope::new().with("b", json!([1, 2])).with("a", json!(1));
        assert_eq!(a.fingerprint(), b.fingerprint());
        let c = RunScope::from_value(json!({"a": 2, "b": [1, 2]}));
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    // ── Policy ─────────────────────────────────────────────────

    #[test]
    fn test_default_effective_policy() {
        let p = EffectivePolicy::default();
        assert_eq!(p.max_concurrent, 1);
        assert_eq!(p.blast_radius.max_entities, Some(100));
        assert_eq!(p.blast_radius.max_percent, Some(10.0));
        assert!(!p.requires_dual_control);
        assert_eq!(p.timeout_sec, 900);
        assert_eq!(p.cooldown_sec, 3600);
        assert!(p.canary.is_none());
    }

    #[test]
    fn test_overlay_merges_nested_fields() {
        let mut p = EffectivePolicy::default();
        p.overlay(&GuardOverrides {
            blast_radius: Some(BlastRadiusOverride {
                max_entities: Some(10),
                max_percent: None,
            }),
            ..Default::default()
        });
        assert_eq!(p.blast_radius.max_entities, Some(10));
        assert_eq!(p.blast_radius.max_percent, Some(10.0));
    }

    #[test]
    fn test_guard_scope_parse() {
        assert_eq!("global".parse::<GuardScope>().unwrap(), GuardScope::Global);
        assert_eq!(
            "playbook:ar.dunning".parse::<GuardScope>().unwrap(),
            GuardScope::playbook("ar.dunning")
        );
        assert!("playbook:".parse::<GuardScope>().is_err());
        assert!("tenant".parse::<GuardScope>().is_err());
        let json = serde_json::to_string(&GuardScope::playbook("x")).unwrap();
        assert_eq!(json, "\"playbook:x\"");
    }

    #[test]
    fn test_guard_overrides_camel_case_nested() {
        let guards: GuardOverrides = serde_json::from_value(json!({
            "max_concurrent": 2,
            "blast_radius": {"maxEntities": 10},
            "canary": {"samplePercent": 10.0, "minEntities": 5}
        }))
        .unwrap();
        assert_eq!(guards.max_concurrent, Some(2));
        assert_eq!(guards.blast_radius.unwrap().max_entities, Some(10));
        assert_eq!(guards.canary.unwrap().min_entities, Some(5));
    }

    #[test]
    fn test_canary_sample_size() {
        let canary = CanaryPolicy {
            sample_percent: 10.0,
            min_entities: 5,
        };
        assert_eq!(canary.sample_size(200), 20);
        assert_eq!(canary.sample_size(30), 5);
        assert_eq!(canary.sample_size(3), 3);
        assert_eq!(canary.sample_size(101), 11);
    }

    // ── Thresholds ─────────────────────────────────────────────

    #[test]
    fn test_threshold_parsing_and_evaluation() {
        let ceiling: Threshold = serde_json::from_value(json!(5)).unwrap();
        assert!(ceiling.passes(5.0));
        assert!(!ceiling.passes(5.1));

        let lt: Threshold = serde_json::from_value(json!({"op": "lt", "value": 3})).unwrap();
        assert!(lt.passes(2.0));
        assert!(!lt.passes(3.0));

        let gt: Threshold = serde_json::from_value(json!({"op": "gt", "value": 3})).unwrap();
        assert!(gt.passes(4.0));

        let eq: Threshold = serde_json::from_value(json!({"op": "eq", "value": 0})).unwrap();
        assert!(eq.passes(0.0));
        assert!(!eq.passes(1.0));

        let between: Threshold =
            serde_json::from_value(json!({"op": "between", "value": [1, 10]})).unwrap();
        assert!(between.passes(1.0));
        assert!(between.passes(10.0));
        assert!(!between.passes(11.0));
    }

    // ── Actions ────────────────────────────────────────────────

    #[test]
    fn test_effect_class_parse() {
        let read: EffectClass = serde_json::from_value(json!("read")).unwrap();
        assert_eq!(read, EffectClass::Read);
        let write: EffectClass = serde_json::from_value(json!("write:payments")).unwrap();
        assert_eq!(write, EffectClass::Write("payments".into()));
        assert!(write.is_write());
        assert!(serde_json::from_value::<EffectClass>(json!("delete")).is_err());
    }

    #[test]
    fn test_input_contract_check() {
        let contract = InputContract::required(&["invoice_ids", "template"]);
        assert!(contract.check(&json!({"invoice_ids": [1], "template": "x"})).is_empty());
        let errors = contract.check(&json!({"invoice_ids": null}));
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("invoice_ids"));
        assert_eq!(contract.check(&json!([1, 2])).len(), 1);
    }

    // ── Errors ─────────────────────────────────────────────────

    #[test]
    fn test_error_display() {
        let err = WardenError::policy("blast_radius", "15 entities exceeds 10");
        assert!(err.to_string().contains("blast_radius"));
        let err = WardenError::blast_radius(BlastRadiusEvaluation {
            allowed: false,
            reason: Some("15 entities exceeds maxEntities 10".into()),
            entity_count: 15,
            percentage: 0.0,
        });
        assert!(err.to_string().contains("15 entities"));
        match err {
            WardenError::PolicyViolation { rule, evaluation, .. } => {
                assert_eq!(rule, "blast_radius");
                assert_eq!(evaluation.unwrap().entity_count, 15);
            }
            other => panic!("unexpected {other:?}"),
        }
        let err = WardenError::not_found("playbook", "ar.dunning");
        assert_eq!(err.to_string(), "playbook not found: ar.dunning");
    }

    #[test]
    fn test_error_retryable() {
        assert!(WardenError::policy("concurrency", "full").is_retryable());
        assert!(WardenError::policy("cooldown", "wait").is_retryable());
        assert!(!WardenError::policy("blast_radius", "too big").is_retryable());
        assert!(!WardenError::Forbidden("self approval".into()).is_retryable());
    }

    #[test]
    fn test_validation_error_joins_messages() {
        let err = WardenError::Validation {
            action: "ar.dunning.send".into(),
            errors: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().ends_with("a; b"));
    }

    // ── Outbox ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_outbox_appends_and_broadcasts() {
        let outbox = Outbox::new(16);
        let mut rx = outbox.subscribe();
        let company = uuid::Uuid::new_v4();
        outbox
            .emit(OutboxEvent::new(company, topics::RUN_QUEUED, "r1", json!({})))
            .unwrap();
        outbox
            .emit(OutboxEvent::new(company, topics::RUN_APPROVED, "r1", json!({})))
            .unwrap();
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.events_for(topics::RUN_QUEUED).len(), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.topic, topics::RUN_QUEUED);
    }

    #[test]
    fn test_outbox_emit_without_subscribers() {
        let outbox = Outbox::default();
        let company = uuid::Uuid::new_v4();
        outbox
            .emit(OutboxEvent::new(company, topics::RUN_COMPLETED, "r", json!({"ok": true})))
            .unwrap();
        assert!(!outbox.is_empty());
    }

    // ── Playbook hashing ───────────────────────────────────────

    #[test]
    fn test_version_hash_is_content_addressed() {
        let steps = vec![StepTemplate {
            action_code: "ar.dunning.send".into(),
            input: json!({"invoice_ids": "{{scope.invoice_ids}}"}),
            outcome_check: None,
        }];
        let a = PlaybookVersion::compute_hash(&steps, &GuardOverrides::default());
        let b = PlaybookVersion::compute_hash(&steps, &GuardOverrides::default());
        assert_eq!(a, b);
        let guards = GuardOverrides {
            max_concurrent: Some(3),
            ..Default::default()
        };
        assert_ne!(a, PlaybookVersion::compute_hash(&steps, &guards));
    }
}
