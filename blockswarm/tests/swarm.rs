use std::time::Duration;

use blockswarm::{
    conf::Conf, metainfo::Metainfo, store::MemoryPersister, Client,
};
use pretty_assertions::assert_eq;
use tokio::time;

const PIECE_LEN: u32 = 256 * 1024;

/// Deterministic content of a little over 4 pieces, so that the last piece
/// and its last block are short.
fn make_content() -> Vec<u8> {
    let len = 4 * PIECE_LEN as usize + 3 * 0x4000 + 321;
    (0..len).map(|i| ((i * 31 + i / 7) % 251) as u8).collect()
}

fn make_conf(state_dir: &std::path::Path) -> Conf {
    let mut conf = Conf::new(state_dir);
    conf.engine.listen_addr = "127.0.0.1:0".parse().unwrap();
    conf
}

// Seeds content from one client and downloads it into another over loopback,
// then restarts the downloader from its persisted state.
#[tokio::test]
async fn test_seed_and_download() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let content = make_content();
    let src_path = dir.path().join("puppy.jpg");
    std::fs::write(&src_path, &content).unwrap();

    let metainfo = Metainfo::create("puppy.jpg", &content, PIECE_LEN, None).unwrap();
    // what a seeder would publish is what a downloader parses
    let metainfo = Metainfo::from_bytes(&metainfo.to_bytes().unwrap()).unwrap();
    assert_eq!(metainfo.piece_count(), 5);

    let seeder = Client::new(
        make_conf(dir.path()),
        metainfo.clone(),
        MemoryPersister::new(),
    )
    .unwrap();
    assert_eq!(seeder.seed_from(&src_path).await.unwrap(), 5);
    assert!(seeder.is_complete().await);
    let seeder_addr = seeder.start().await.unwrap();

    let persister = MemoryPersister::new();
    let downloader =
        Client::new(make_conf(dir.path()), metainfo.clone(), persister.clone())
            .unwrap();
    assert!(!downloader.is_complete().await);
    downloader.start().await.unwrap();
    downloader.connect(seeder_addr).await.unwrap();

    time::timeout(Duration::from_secs(30), downloader.wait_for_completion())
        .await
        .expect("download didn't complete in time");

    let have = downloader.have().await;
    assert_eq!(have.len(), 5);
    assert!(have.all());
    for (index, hash) in metainfo.piece_hashes().iter().enumerate() {
        assert_eq!(&downloader.hash_of(index).await.unwrap(), hash);
    }

    let dst_path = dir.path().join("puppy-copy.jpg");
    downloader.write_content(&dst_path).await.unwrap();
    let downloaded = std::fs::read(&dst_path).unwrap();
    assert_eq!(downloaded.len(), content.len());
    assert!(downloaded == content);

    downloader.shutdown().await;
    seeder.shutdown().await;

    // a restarted downloader has everything without connecting to anyone
    let restarted =
        Client::new(make_conf(dir.path()), metainfo.clone(), persister).unwrap();
    assert!(restarted.is_complete().await);
    assert_eq!(restarted.have().await, have);
    for (index, hash) in metainfo.piece_hashes().iter().enumerate() {
        assert_eq!(&restarted.hash_of(index).await.unwrap(), hash);
    }
    time::timeout(Duration::from_secs(1), restarted.wait_for_completion())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_seed_rejects_mismatching_content() {
    let dir = tempfile::tempdir().unwrap();
    let content = make_content();
    let metainfo = Metainfo::create("puppy.jpg", &content, PIECE_LEN, None).unwrap();

    // one byte short changes the length of the last piece
    let path = dir.path().join("truncated");
    std::fs::write(&path, &content[..content.len() - 1]).unwrap();

    let client =
        Client::new(make_conf(dir.path()), metainfo, MemoryPersister::new()).unwrap();
    assert!(client.seed_from(&path).await.is_err());
    assert!(!client.is_complete().await);
}
