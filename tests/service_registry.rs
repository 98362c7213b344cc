//! Service registry lookups across threads and namespaces

use std::sync::Arc;
use std::thread;
use mcu_kube::registry::DEFAULT_NAMESPACE;
use mcu_kube::{Selector, ServiceRegistry, ServiceSpec};

#[test]
fn test_duplicate_registration() {
    let registry: ServiceRegistry<u32> = ServiceRegistry::new();

    registry.register("storage", 1).unwrap();
    assert!(registry.register("storage", 2).is_err());
    assert_eq!(registry.count(), 1);
    assert_eq!(registry.get_service("storage"), Some(1));
}

#[test]
fn test_selector_prefers_double_match() {
    let registry: ServiceRegistry<&'static str> = ServiceRegistry::new();
    registry
        .register_spec(
            ServiceSpec::new("display-a").namespace("ui").label("tier", "core"),
            "a",
        )
        .unwrap();
    registry
        .register_spec(ServiceSpec::new("display-b").namespace("ui"), "b")
        .unwrap();

    let found =
        registry.get_with_selector(&[Selector::namespace("ui"), Selector::label("tier", "core")]);
    assert_eq!(found, Some("a"));
}

#[test]
fn test_name_only_registration_uses_default_namespace() {
    let registry: ServiceRegistry<u32> = ServiceRegistry::new();
    registry.register("gui", 7).unwrap();

    let info = registry.list().into_iter().next().unwrap();
    assert_eq!(info.namespace, DEFAULT_NAMESPACE);
    assert!(info.labels.is_empty());
    assert_eq!(
        registry.get_with_selector(&[Selector::namespace(DEFAULT_NAMESPACE)]),
        Some(7)
    );
}

#[test]
fn test_unregister_then_register_again() {
    let registry: ServiceRegistry<u32> = ServiceRegistry::new();
    registry.register("loader", 1).unwrap();

    assert!(registry.unregister("loader"));
    assert!(!registry.unregister("loader"));
    assert!(registry.is_empty());
    assert_eq!(registry.get_service("loader"), None);

    registry.register("loader", 2).unwrap();
    assert_eq!(registry.get_service("loader"), Some(2));
}

#[test]
fn test_concurrent_registration() {
    let registry: Arc<ServiceRegistry<usize>> = Arc::new(ServiceRegistry::new());

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let registry = registry.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    registry.register(format!("svc-{}-{}", t, i), t * 100 + i).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(registry.count(), 100);
    assert_eq!(registry.get_service("svc-3-24"), Some(324));
}
