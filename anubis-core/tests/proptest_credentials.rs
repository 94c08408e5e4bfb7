//! Property-based tests for the credential store using proptest.

use std::collections::BTreeMap;

use proptest::prelude::*;
use serde_json::Value;

use anubis_core::{Attributes, CredentialStore, Credentials};

fn credentials_strategy() -> impl Strategy<Value = Credentials> {
    prop::collection::btree_map("[a-z_]{1,8}", "[A-Za-z0-9:]{0,16}", 0..5)
}

fn attributes_strategy() -> impl Strategy<Value = Attributes> {
    prop::collection::btree_map("[a-z_]{1,6}", any::<i64>().prop_map(Value::from), 0..5)
}

// --- Merge semantics ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn credentials_are_replaced_and_attributes_merged(
        first_creds in credentials_strategy(),
        second_creds in credentials_strategy(),
        first_settings in attributes_strategy(),
        second_settings in attributes_strategy(),
        first_meta in attributes_strategy(),
        second_meta in attributes_strategy(),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path());

        store
            .save_credential("p", first_creds, Some(first_settings.clone()), Some(first_meta.clone()))
            .unwrap();
        store.deactivate("p").unwrap();
        let saved = store
            .save_credential("p", second_creds.clone(), Some(second_settings.clone()), Some(second_meta.clone()))
            .unwrap();

        let mut expected_settings: BTreeMap<String, Value> = first_settings;
        expected_settings.extend(second_settings);
        let mut expected_meta: BTreeMap<String, Value> = first_meta;
        expected_meta.extend(second_meta);

        prop_assert_eq!(&saved.credentials, &second_creds);
        prop_assert_eq!(&saved.settings, &expected_settings);
        prop_assert_eq!(&saved.metadata, &expected_meta);
        prop_assert!(saved.active);
        prop_assert!(saved.created_at <= saved.last_used);

        // What was persisted is what a fresh instance sees.
        let reloaded = CredentialStore::open(dir.path());
        prop_assert_eq!(reloaded.get_credential("p"), Some(saved));
    }

    #[test]
    fn usage_accumulates(usages in prop::collection::vec(0u64..1_000_000, 1..10), remaining in -1i64..1_000) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path());
        store.save_api_key("openai", "sk-test").unwrap();

        for used in &usages {
            store.record_usage("openai", *used, remaining).unwrap();
        }

        let summary = store
            .list_api_keys()
            .into_iter()
            .find(|k| k.provider == "openai")
            .unwrap();
        prop_assert_eq!(summary.tokens_used, usages.iter().sum::<u64>());
        prop_assert_eq!(summary.tokens_remaining, remaining);
    }

    #[test]
    fn deactivated_platforms_are_not_listed(names in prop::collection::btree_set("[a-z]{1,6}", 1..6), drop_first in any::<bool>()) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path());
        for name in &names {
            store.save_credential(name, Credentials::new(), None, None).unwrap();
        }
        let mut expected = names.clone();
        if drop_first {
            let first = names.iter().next().unwrap().clone();
            store.deactivate(&first).unwrap();
            expected.remove(&first);
            prop_assert!(store.get_credential(&first).is_some());
        }
        prop_assert_eq!(store.list_active_platforms(), expected);
    }
}
