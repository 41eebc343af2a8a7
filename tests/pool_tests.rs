// ABOUTME: Integration tests for ConnectionPool against the scripted transport
//
// Covers capacity limits, FIFO hand-off, idle reaping, connection failures,
// one-shot exec and pool shutdown.

mod helpers;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use helpers::{err, out, settle, test_pool_config, ScriptedConnector, Step};
use pretty_assertions::assert_eq;
use ptygate::pool::{ExecOptions, PoolError};
use tokio::sync::mpsc;

// =============================================================================
// Capacity
// =============================================================================

#[tokio::test]
async fn test_acquire_times_out_when_all_connections_are_leased() {
    // Arrange: a pool of two, both leased
    let connector = ScriptedConnector::new();
    let pool = connector.pool(test_pool_config(2));
    let _first = pool.acquire().await.unwrap();
    let _second = pool.acquire().await.unwrap();

    // Act
    let result = pool.acquire_timeout(Duration::from_millis(50)).await;

    // Assert
    assert!(matches!(result, Err(PoolError::AcquireTimeout { .. })));
    let stats = pool.stats();
    assert_eq!(stats.in_use, 2);
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.metrics.acquire_timeouts, 1);
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_released_connection_is_reused() {
    let connector = ScriptedConnector::new();
    let pool = connector.pool(test_pool_config(2));

    let first = pool.acquire().await.unwrap();
    let first_id = first.id();
    pool.release(first);

    let second = pool.acquire().await.unwrap();
    assert_eq!(second.id(), first_id);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_never_leased_twice() {
    let connector = ScriptedConnector::new();
    let pool = connector.pool(test_pool_config(3));
    let leased = Arc::new(Mutex::new(HashSet::new()));

    let mut tasks = Vec::new();
    for _ in 0..24 {
        let pool = pool.clone();
        let leased = Arc::clone(&leased);
        tasks.push(tokio::spawn(async move {
            let conn = pool.acquire().await.unwrap();
            assert!(leased.lock().unwrap().insert(conn.id()), "connection issued twice");
            tokio::time::sleep(Duration::from_millis(2)).await;
            assert!(leased.lock().unwrap().remove(&conn.id()));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(connector.connects() <= 3);
    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.metrics.acquires_total, 24);
}

// =============================================================================
// Waiters
// =============================================================================

#[tokio::test]
async fn test_waiters_are_served_in_arrival_order() {
    // Arrange: single connection held while two acquirers queue up
    let connector = ScriptedConnector::new();
    let pool = connector.pool(test_pool_config(1));
    let held = pool.acquire().await.unwrap();
    let (order_tx, mut order_rx) = mpsc::unbounded_channel();

    for name in ["first", "second"] {
        let pool = pool.clone();
        let order_tx = order_tx.clone();
        tokio::spawn(async move {
            let conn = pool.acquire().await.unwrap();
            order_tx.send(name).unwrap();
            drop(conn);
        });
        settle().await;
    }
    assert_eq!(pool.stats().waiting, 2);

    // Act
    drop(held);

    // Assert
    assert_eq!(order_rx.recv().await, Some("first"));
    assert_eq!(order_rx.recv().await, Some("second"));
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_cancelled_waiter_leaves_the_queue() {
    let connector = ScriptedConnector::new();
    let pool = connector.pool(test_pool_config(1));
    let held = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    settle().await;
    assert_eq!(pool.stats().waiting, 1);

    waiter.abort();
    settle().await;
    assert_eq!(pool.stats().waiting, 0);

    drop(held);
    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn test_broken_lease_makes_room_for_waiter() {
    let connector = ScriptedConnector::new();
    let pool = connector.pool(test_pool_config(1));
    let held = pool.acquire().await.unwrap();
    let broken_id = held.id();
    held.mark_broken();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|conn| conn.id()) })
    };
    settle().await;

    drop(held);
    let new_id = waiter.await.unwrap().unwrap();

    assert_ne!(new_id, broken_id);
    assert_eq!(connector.connects(), 2);
    settle().await;
    assert_eq!(connector.closes(), 1);
    assert_eq!(pool.stats().metrics.connections_evicted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_waiter_deadline_covers_connect_into_freed_slot() {
    // Arrange: the only connection is broken, so its release frees a slot
    // that the waiter has to fill with a slow connect
    let connector = ScriptedConnector::new();
    let pool = connector.pool(test_pool_config(1));
    let held = pool.acquire().await.unwrap();
    held.mark_broken();
    connector.set_connect_delay(Duration::from_secs(20));

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let result = pool.acquire_timeout(Duration::from_millis(50)).await;
            (result.map(|conn| conn.id()), started.elapsed())
        })
    };
    settle().await;

    // Act
    drop(held);
    let (result, elapsed) = waiter.await.unwrap();

    // Assert: the caller's 50ms bound held, not the 5s connect timeout
    assert!(matches!(result, Err(PoolError::AcquireTimeout { .. })));
    assert!(elapsed < Duration::from_secs(1), "waited {elapsed:?}");
    let stats = pool.stats();
    assert_eq!(stats.connecting, 0);
    assert_eq!(stats.total, 0);
    assert_eq!(stats.metrics.acquire_timeouts, 1);
    assert_eq!(stats.metrics.connect_failures, 0);
}

// =============================================================================
// Health and reaping
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_idle_connections_are_reaped() {
    let connector = ScriptedConnector::new();
    let mut config = test_pool_config(2);
    config.idle_timeout = Duration::from_secs(60);
    config.reap_interval = Duration::from_secs(30);
    let pool = connector.pool(config);

    drop(pool.acquire().await.unwrap());
    assert_eq!(pool.stats().idle, 1);

    tokio::time::sleep(Duration::from_secs(91)).await;
    settle().await;

    let stats = pool.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.metrics.connections_reaped, 1);
    assert_eq!(connector.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reap_keeps_recently_used_connections() {
    let connector = ScriptedConnector::new();
    let mut config = test_pool_config(2);
    config.idle_timeout = Duration::from_secs(60);
    let pool = connector.pool(config);

    drop(pool.acquire().await.unwrap());
    tokio::time::advance(Duration::from_secs(30)).await;

    assert_eq!(pool.reap_idle().await, 0);
    assert_eq!(pool.stats().idle, 1);
}

#[tokio::test]
async fn test_dead_idle_session_is_replaced_on_acquire() {
    let connector = ScriptedConnector::new();
    let pool = connector.pool(test_pool_config(1));
    let first_id = pool.acquire().await.unwrap().id();

    connector.drop_all_sessions();

    let conn = pool.acquire().await.unwrap();
    assert_ne!(conn.id(), first_id);
    assert_eq!(connector.connects(), 2);
}

// =============================================================================
// Connection failures
// =============================================================================

#[tokio::test]
async fn test_failed_connect_is_not_pooled() {
    let connector = ScriptedConnector::new();
    let pool = connector.pool(test_pool_config(1));
    connector.fail_next_connects(1);

    let result = pool.acquire().await;
    assert!(matches!(result, Err(PoolError::Connect { .. })));

    let stats = pool.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.connecting, 0);
    assert_eq!(stats.metrics.connect_failures, 1);

    // Capacity was given back
    assert!(pool.acquire().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_slow_connect_times_out() {
    let connector = ScriptedConnector::new();
    connector.set_connect_delay(Duration::from_secs(60));
    let mut config = test_pool_config(1);
    config.connect_timeout = Duration::from_secs(2);
    let pool = connector.pool(config);

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::ConnectTimeout { .. }));
    assert!(err.is_retryable());
    assert_eq!(pool.stats().connecting, 0);
}

// =============================================================================
// exec
// =============================================================================

#[tokio::test]
async fn test_exec_collects_output_in_working_directory() {
    let connector = ScriptedConnector::new();
    connector.on("git status", vec![out("clean\n"), err("hint\n"), Step::Exit(0)]);
    let pool = connector.pool(test_pool_config(1));
    let conn = pool.acquire().await.unwrap();

    let output = pool
        .exec(
            &conn,
            "git status",
            ExecOptions {
                cwd: Some("/home/alice/my project".to_string()),
                ..ExecOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(output.stdout, "clean\n");
    assert_eq!(output.stderr, "hint\n");
    assert!(output.success());

    let spawned = connector.spawned();
    assert_eq!(spawned[0].command, "cd '/home/alice/my project' && git status");
    assert!(!spawned[0].pty);
}

#[tokio::test]
async fn test_exec_nonzero_exit_is_data() {
    let connector = ScriptedConnector::new();
    connector.on("false", vec![Step::Exit(3)]);
    let pool = connector.pool(test_pool_config(1));
    let conn = pool.acquire().await.unwrap();

    let output = pool.exec(&conn, "false", ExecOptions::default()).await.unwrap();
    assert_eq!(output.exit_code, Some(3));
    assert!(!output.success());
    assert!(!conn.is_broken());
}

#[tokio::test]
async fn test_exec_channel_closed_without_status() {
    let connector = ScriptedConnector::new();
    connector.on("vanish", vec![out("partial"), Step::CloseChannel("eof".to_string())]);
    let pool = connector.pool(test_pool_config(1));
    let conn = pool.acquire().await.unwrap();

    let output = pool.exec(&conn, "vanish", ExecOptions::default()).await.unwrap();
    assert_eq!(output.exit_code, None);
    assert_eq!(output.stdout, "partial");
    assert!(!conn.is_broken());
}

#[tokio::test(start_paused = true)]
async fn test_exec_timeout_terminates_command_and_keeps_connection() {
    let connector = ScriptedConnector::new();
    connector.on("sleep", vec![Step::Hang]);
    let pool = connector.pool(test_pool_config(1));
    let conn = pool.acquire().await.unwrap();

    let result = pool
        .exec(
            &conn,
            "sleep 100",
            ExecOptions {
                timeout: Some(Duration::from_millis(50)),
                ..ExecOptions::default()
            },
        )
        .await;

    assert!(matches!(result, Err(PoolError::ExecTimeout { .. })));
    assert_eq!(connector.terminates(), 1);
    assert!(!conn.is_broken());
    drop(conn);
    assert_eq!(pool.stats().idle, 1);
}

#[tokio::test(start_paused = true)]
async fn test_exec_timeout_with_stuck_command_evicts_connection() {
    let connector = ScriptedConnector::new();
    connector.on("sleep", vec![Step::Hang]);
    connector.ignore_terminate();
    let pool = connector.pool(test_pool_config(1));
    let conn = pool.acquire().await.unwrap();

    let result = pool
        .exec(
            &conn,
            "sleep 100",
            ExecOptions {
                timeout: Some(Duration::from_millis(50)),
                ..ExecOptions::default()
            },
        )
        .await;

    assert!(matches!(result, Err(PoolError::ExecTimeout { .. })));
    assert!(conn.is_broken());
    drop(conn);
    settle().await;
    let stats = pool.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.metrics.connections_evicted, 1);
}

#[tokio::test]
async fn test_exec_transport_failure_evicts_connection() {
    let connector = ScriptedConnector::new();
    connector.on("uptime", vec![Step::Fail("reset by peer".to_string())]);
    let pool = connector.pool(test_pool_config(1));
    let conn = pool.acquire().await.unwrap();

    let result = pool.exec(&conn, "uptime", ExecOptions::default()).await;
    assert!(matches!(result, Err(PoolError::Transport(_))));
    assert!(conn.is_broken());

    drop(conn);
    settle().await;
    assert_eq!(pool.stats().total, 0);
    assert_eq!(connector.closes(), 1);
}

#[tokio::test]
async fn test_connection_check() {
    let connector = ScriptedConnector::new();
    let pool = connector.pool(test_pool_config(1));
    assert!(pool.test_connection().await);
    assert_eq!(connector.commands(), vec!["echo ptygate".to_string()]);
    // The lease went back
    assert_eq!(pool.stats().idle, 1);

    let failing = ScriptedConnector::new();
    failing.on("echo ptygate", vec![Step::Exit(1)]);
    assert!(!failing.pool(test_pool_config(1)).test_connection().await);
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_destroy_closes_everything_and_fails_waiters() {
    let connector = ScriptedConnector::new();
    let pool = connector.pool(test_pool_config(1));
    let held = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|conn| conn.id()) })
    };
    settle().await;

    pool.destroy().await;

    assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
    assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    assert_eq!(connector.closes(), 1);

    // Releasing after shutdown is harmless
    drop(held);
    let stats = pool.stats();
    assert!(stats.closed);
    assert_eq!(stats.total, 0);
}
