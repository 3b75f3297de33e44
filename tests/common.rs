//! The common pool is process-wide state, so its whole lifecycle is covered
//! by a single test.

use std::{sync::mpsc, time::Duration};

use dynpool::{common, configure_common, shutdown_common, Error};

#[test]
fn common_pool_lifecycle() {
    let _ = env_logger::builder().is_test(true).try_init();

    // Nothing to do before the pool exists.
    shutdown_common();

    configure_common(|builder| builder.size(..=2)).unwrap();
    assert!(matches!(
        configure_common(|builder| builder),
        Err(Error::CommonAlreadyInitialized)
    ));

    let first = common();
    assert_eq!(first.max_pool_size(), 2);

    let (tx, rx) = mpsc::channel();
    common().submit(move || tx.send(()).unwrap());
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first.current_pool_size(), 1);

    shutdown_common();
    assert!(first.is_shut_down());
    assert_eq!(first.current_pool_size(), 0);

    // The next access builds a fresh pool with the same configuration.
    let second = common();
    assert!(!second.is_shut_down());
    assert_eq!(second.current_pool_size(), 0);
    assert_eq!(second.max_pool_size(), 2);

    let (tx, rx) = mpsc::channel();
    second.submit(move || tx.send(()).unwrap());
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Shutting down a handle directly also makes way for a fresh pool.
    second.shutdown();
    let third = common();
    assert!(!third.is_shut_down());
    assert_eq!(third.max_pool_size(), 2);

    let (tx, rx) = mpsc::channel();
    third.submit(move || tx.send(()).unwrap());
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // A directly shut down pool does not block reconfiguration either.
    third.shutdown();
    assert!(configure_common(|builder| builder.size(..=3)).is_ok());
    assert_eq!(common().max_pool_size(), 3);

    shutdown_common();
    assert!(configure_common(|builder| builder.size(..=4)).is_ok());
    assert_eq!(common().max_pool_size(), 4);
    shutdown_common();
}
