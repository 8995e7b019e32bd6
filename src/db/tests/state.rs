use crate::db::*;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_shutdown_state_initial() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    assert!(
        db.was_unclean_shutdown().await.unwrap(),
        "fresh database should report an unclean shutdown"
    );

    db.close().await;
}

#[tokio::test]
async fn test_shutdown_state_clean_lifecycle() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    db.set_clean_start().await.unwrap();
    assert!(db.was_unclean_shutdown().await.unwrap());

    db.set_clean_shutdown().await.unwrap();
    assert!(!db.was_unclean_shutdown().await.unwrap());

    // Next session starts: unclean again until it shuts down properly
    db.set_clean_start().await.unwrap();
    assert!(db.was_unclean_shutdown().await.unwrap());

    db.close().await;
}
