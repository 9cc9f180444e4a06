use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use super::*;
use crate::test_utils::archive_doc;
use crate::test_utils::enable_logger;
use crate::utils::time::now_secs;
use crate::ArchiveConfig;
use crate::ArchiveStore;
use crate::LeaderNotifier;
use crate::MemArchiveStore;

const DAY: i64 = 24 * 3600;

fn config(page_size: usize) -> ArchiveConfig {
    ArchiveConfig {
        page_size,
        page_sleep_ms: 10,
        check_interval_secs: 1,
        ..Default::default()
    }
}

async fn seed(
    archive: &MemArchiveStore,
    old: usize,
    fresh: usize,
) {
    let now = now_secs();
    for i in 0..old {
        archive
            .insert(archive_doc("cc_HostBase", &format!("old-{i}"), json!({}), now - 8 * DAY))
            .await
            .unwrap();
    }
    for i in 0..fresh {
        archive
            .insert(archive_doc("cc_HostBase", &format!("new-{i}"), json!({}), now - DAY))
            .await
            .unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn clean_once_removes_expired_pages() {
    enable_logger();
    let archive = Arc::new(MemArchiveStore::new());
    seed(&archive, 5, 2).await;

    let cleaner = ArchiveCleaner::new(archive.clone(), Arc::new(LeaderNotifier::new(true)), config(2));
    assert_eq!(cleaner.clean_once().await.unwrap(), 5);
    assert_eq!(archive.len(), 2);
}

#[test]
fn runs_at_most_once_per_interval() {
    let mut cleaner = ArchiveCleaner::new(
        Arc::new(MemArchiveStore::new()),
        Arc::new(LeaderNotifier::new(true)),
        config(10),
    );
    assert!(cleaner.due(1_000));

    cleaner.last_run = Some(1_000);
    assert!(!cleaner.due(1_000 + DAY - 1));
    assert!(cleaner.due(1_000 + DAY));
}

#[tokio::test(start_paused = true)]
async fn only_master_cleans() {
    enable_logger();
    let archive = Arc::new(MemArchiveStore::new());
    seed(&archive, 3, 0).await;
    let leader = Arc::new(LeaderNotifier::new(false));

    let cleaner = ArchiveCleaner::new(archive.clone(), leader.clone(), config(10));
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let handle = tokio::spawn(cleaner.run(shutdown_rx));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(archive.len(), 3);

    leader.set_leader(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(archive.len(), 0);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}
