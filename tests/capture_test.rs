use bytes::Bytes;
use ksniff::capture::{BinaryPresence, Destination, SessionState, Sniffer, SinkKind};
use ksniff::config::SniffConfig;
use ksniff::exec::InMemoryCluster;
use ksniff::k8s::CaptureTarget;
use ksniff::{Phase, SniffError};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const REMOTE_TCPDUMP: &str = "/tmp/static-tcpdump";

fn target() -> CaptureTarget {
    CaptureTarget::new("default", "web-1", "app")
}

fn pcap_stream() -> Vec<Bytes> {
    let mut header = Vec::new();
    header.extend_from_slice(&0xa1b2c3d4u32.to_le_bytes());
    header.extend_from_slice(&2u16.to_le_bytes());
    header.extend_from_slice(&4u16.to_le_bytes());
    header.extend_from_slice(&0i32.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes());
    header.extend_from_slice(&262144u32.to_le_bytes());
    header.extend_from_slice(&1u32.to_le_bytes());

    let mut chunks = vec![Bytes::from(header)];
    for seq in 0u8..5 {
        let payload = vec![seq; 60 + seq as usize];
        let mut record = Vec::new();
        record.extend_from_slice(&(1_700_000_000u32 + seq as u32).to_le_bytes());
        record.extend_from_slice(&0u32.to_le_bytes());
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&payload);
        chunks.push(Bytes::from(record));
    }
    chunks
}

fn concat(chunks: &[Bytes]) -> Vec<u8> {
    chunks.iter().flat_map(|c| c.to_vec()).collect()
}

fn local_binary() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"\x7fELF static tcpdump").unwrap();
    file.flush().unwrap();
    file
}

fn config(local: &Path) -> SniffConfig {
    SniffConfig {
        local_binary_path: local.to_path_buf(),
        connect_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn wait_for_idle(cluster: &InMemoryCluster) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while cluster.running() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("remote commands still running");
}

#[tokio::test]
async fn test_first_run_uploads_second_run_reuses() {
    let local = local_binary();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.pcap");
    let cluster = InMemoryCluster::new(target()).with_capture_output(pcap_stream());

    let mut first = Sniffer::new(cluster.clone(), target(), config(local.path()));
    first
        .run(Destination::File(out.clone()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first.session().state(), SessionState::Done);
    assert!(first.session().upload_attempted());
    assert_eq!(first.session().sink_kind(), Some(SinkKind::File));
    assert_eq!(cluster.count_commands("tar"), 1);
    assert!(cluster.file(REMOTE_TCPDUMP).unwrap().is_executable());
    assert_eq!(std::fs::read(&out).unwrap(), concat(&pcap_stream()));

    let mut second = Sniffer::new(cluster.clone(), target(), config(local.path()));
    second
        .run(Destination::File(out.clone()), CancellationToken::new())
        .await
        .unwrap();

    assert!(!second.session().upload_attempted());
    assert_eq!(second.session().presence(), BinaryPresence::Present);
    assert_eq!(cluster.count_commands("tar"), 1);
    assert_eq!(cluster.count_commands(REMOTE_TCPDUMP), 2);
}

#[tokio::test]
async fn test_capture_argv_carries_filter() {
    let local = local_binary();
    let dir = tempfile::tempdir().unwrap();
    let cluster = InMemoryCluster::new(target())
        .with_file(REMOTE_TCPDUMP, b"ELF".to_vec(), 0o755)
        .with_capture_output(pcap_stream());

    let config = SniffConfig {
        filter: "tcp port 443".to_string(),
        ..config(local.path())
    };
    Sniffer::new(cluster.clone(), target(), config)
        .run(
            Destination::File(dir.path().join("tls.pcap")),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let capture = cluster
        .commands()
        .into_iter()
        .find(|argv| argv[0] == REMOTE_TCPDUMP)
        .unwrap();
    assert_eq!(
        capture,
        vec![REMOTE_TCPDUMP, "-i", "any", "-U", "-w", "-", "tcp port 443"]
    );
}

#[tokio::test]
async fn test_inconclusive_probe_uploads_anyway() {
    let local = local_binary();
    let dir = tempfile::tempdir().unwrap();
    let cluster = InMemoryCluster::new(target())
        .with_file(REMOTE_TCPDUMP, b"old".to_vec(), 0o755)
        .with_probe_warning("ls: warning: locale not set\n")
        .with_capture_output(pcap_stream());

    let mut sniffer = Sniffer::new(cluster.clone(), target(), config(local.path()));
    sniffer
        .run(
            Destination::File(dir.path().join("out.pcap")),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(sniffer.session().upload_attempted());
    assert_eq!(cluster.count_commands("tar"), 1);
    assert_eq!(
        cluster.file(REMOTE_TCPDUMP).unwrap().data,
        b"\x7fELF static tcpdump".to_vec()
    );
}

#[tokio::test]
async fn test_failed_upload_aborts_before_capture() {
    let local = local_binary();
    let dir = tempfile::tempdir().unwrap();
    let cluster = InMemoryCluster::new(target()).with_read_only_dir("/tmp");

    let mut sniffer = Sniffer::new(cluster.clone(), target(), config(local.path()));
    let err = sniffer
        .run(
            Destination::File(dir.path().join("out.pcap")),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Some(Phase::Upload));
    assert!(matches!(err.root_cause(), SniffError::ProvisioningFailed(_)));
    assert!(err.to_string().contains("Permission denied"));
    assert_eq!(cluster.count_commands(REMOTE_TCPDUMP), 0);
    assert_eq!(sniffer.session().state(), SessionState::BinaryChecked);
}

#[tokio::test]
async fn test_missing_local_binary_fails_fast() {
    let cluster = InMemoryCluster::new(target());
    let config = config(Path::new("/no/such/tcpdump-static"));

    let err = Sniffer::new(cluster.clone(), target(), config)
        .run(Destination::File("unused.pcap".into()), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Some(Phase::Upload));
    assert!(matches!(err.root_cause(), SniffError::LocalIo { .. }));
    assert_eq!(cluster.count_commands("tar"), 0);
}

#[tokio::test]
async fn test_unreachable_target_fails_in_probe() {
    let local = local_binary();
    let cluster = InMemoryCluster::new(target());
    let elsewhere = CaptureTarget::new("default", "web-1", "sidecar");

    let err = Sniffer::new(cluster.clone(), elsewhere, config(local.path()))
        .run(Destination::File("unused.pcap".into()), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Some(Phase::PresenceProbe));
    assert!(matches!(err.root_cause(), SniffError::Connection(_)));
    assert!(cluster.commands().is_empty());
}

#[tokio::test]
async fn test_cancelled_file_capture_keeps_output() {
    let local = local_binary();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.pcap");
    let cluster = InMemoryCluster::new(target())
        .with_capture_output(pcap_stream())
        .with_endless_capture();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watched = out.clone();
    tokio::spawn(async move {
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let len = std::fs::metadata(&watched).map(|m| m.len()).unwrap_or(0);
                if len > 24 {
                    break;
                }
            }
        })
        .await;
        trigger.cancel();
    });

    let mut sniffer = Sniffer::new(cluster.clone(), target(), config(local.path()));
    sniffer.run(Destination::File(out.clone()), cancel).await.unwrap();

    let written = std::fs::read(&out).unwrap();
    assert!(written.len() > 24);
    assert_eq!(&written[..4], &0xa1b2c3d4u32.to_le_bytes());
    assert_eq!(sniffer.session().state(), SessionState::Done);
    wait_for_idle(&cluster).await;
}

#[tokio::test]
async fn test_interrupted_capture_is_reported() {
    let local = local_binary();
    let dir = tempfile::tempdir().unwrap();
    let cluster = InMemoryCluster::new(target())
        .with_file(REMOTE_TCPDUMP, b"ELF".to_vec(), 0o755)
        .with_capture_output(pcap_stream())
        .with_capture_interrupted_after(2);

    let err = Sniffer::new(cluster, target(), config(local.path()))
        .run(
            Destination::File(dir.path().join("out.pcap")),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Some(Phase::Capture));
    assert!(matches!(err.root_cause(), SniffError::StreamInterrupted(_)));
}

#[tokio::test]
async fn test_cancel_before_start_opens_no_channel() {
    let local = local_binary();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.pcap");
    let cluster = InMemoryCluster::new(target()).with_capture_output(pcap_stream());

    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut sniffer = Sniffer::new(cluster.clone(), target(), config(local.path()));
    sniffer.run(Destination::File(out.clone()), cancel).await.unwrap();

    assert!(cluster.commands().is_empty());
    assert!(cluster.file(REMOTE_TCPDUMP).is_none());
    assert_eq!(sniffer.session().state(), SessionState::Idle);
    assert!(!out.exists());
}

#[tokio::test]
async fn test_cancel_during_upload_skips_capture() {
    let mut local = tempfile::NamedTempFile::new().unwrap();
    local.write_all(&vec![0x90u8; 1024 * 1024]).unwrap();
    local.flush().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.pcap");
    let cluster = InMemoryCluster::new(target())
        .with_pipe_capacity(1)
        .with_capture_output(pcap_stream());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watched = cluster.clone();
    tokio::spawn(async move {
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            while watched.count_commands("tar") == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        trigger.cancel();
    });

    let mut sniffer = Sniffer::new(cluster.clone(), target(), config(local.path()));
    sniffer.run(Destination::File(out.clone()), cancel).await.unwrap();

    assert_eq!(cluster.count_commands(REMOTE_TCPDUMP), 0);
    assert!(sniffer.session().state() < SessionState::Capturing);
    assert!(!out.exists());
    wait_for_idle(&cluster).await;
}

#[tokio::test]
async fn test_remote_path_with_spaces_is_found() {
    let local = local_binary();
    let dir = tempfile::tempdir().unwrap();
    let remote = "/opt/sniff tools/tcpdump";
    let cluster = InMemoryCluster::new(target())
        .with_file(remote, b"ELF".to_vec(), 0o755)
        .with_capture_output(pcap_stream());

    let config = SniffConfig {
        remote_binary_path: remote.to_string(),
        ..config(local.path())
    };
    let mut sniffer = Sniffer::new(cluster.clone(), target(), config);
    sniffer
        .run(
            Destination::File(dir.path().join("out.pcap")),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(sniffer.session().presence(), BinaryPresence::Present);
    assert_eq!(cluster.count_commands("tar"), 0);
    assert_eq!(cluster.count_commands(remote), 1);
}

#[cfg(unix)]
mod viewer {
    use super::*;

    fn shell_viewer(script: String) -> Destination {
        Destination::Viewer(vec!["sh".to_string(), "-c".to_string(), script])
    }

    #[tokio::test]
    async fn test_viewer_exit_ends_invocation_and_closes_channel() {
        let local = local_binary();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("viewer.pcap");
        let cluster = InMemoryCluster::new(target())
            .with_capture_output(pcap_stream())
            .with_endless_capture();

        let mut sniffer = Sniffer::new(cluster.clone(), target(), config(local.path()));
        sniffer
            .run(
                shell_viewer(format!("head -c 100 > '{}'", out.display())),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let expected = concat(&pcap_stream());
        assert_eq!(std::fs::read(&out).unwrap(), expected[..100].to_vec());
        assert_eq!(sniffer.session().sink_kind(), Some(SinkKind::Viewer));
        wait_for_idle(&cluster).await;
    }

    #[tokio::test]
    async fn test_slow_viewer_receives_every_byte() {
        let local = local_binary();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("slow.pcap");
        let chunks: Vec<Bytes> = (0..64u32)
            .map(|i| Bytes::from(vec![(i % 256) as u8; 4096]))
            .collect();
        let cluster = InMemoryCluster::new(target())
            .with_pipe_capacity(512)
            .with_capture_output(chunks.clone());

        Sniffer::new(cluster, target(), config(local.path()))
            .run(
                shell_viewer(format!("sleep 0.3; cat > '{}'", out.display())),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&out).unwrap(), concat(&chunks));
    }

    #[tokio::test]
    async fn test_viewer_failure_is_reported() {
        let local = local_binary();
        let cluster = InMemoryCluster::new(target())
            .with_capture_output(pcap_stream())
            .with_endless_capture();

        let err = Sniffer::new(cluster.clone(), target(), config(local.path()))
            .run(shell_viewer("exit 3".to_string()), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.phase(), Some(Phase::Capture));
        assert!(matches!(err.root_cause(), SniffError::Viewer(_)));
        wait_for_idle(&cluster).await;
    }

    #[tokio::test]
    async fn test_interrupted_capture_stops_running_viewer() {
        let local = local_binary();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("viewer.pcap");
        let cluster = InMemoryCluster::new(target())
            .with_capture_output(pcap_stream())
            .with_capture_interrupted_after(1);

        let started = std::time::Instant::now();
        let err = Sniffer::new(cluster.clone(), target(), config(local.path()))
            .run(
                shell_viewer(format!("cat > '{}'; exec sleep 30", out.display())),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.phase(), Some(Phase::Capture));
        assert!(matches!(err.root_cause(), SniffError::StreamInterrupted(_)));
        assert!(started.elapsed() < Duration::from_secs(20));
        wait_for_idle(&cluster).await;
    }

    #[tokio::test]
    async fn test_missing_viewer_is_reported() {
        let local = local_binary();
        let cluster = InMemoryCluster::new(target()).with_capture_output(pcap_stream());

        let err = Sniffer::new(cluster, target(), config(local.path()))
            .run(
                Destination::Viewer(vec!["/no/such/wireshark".to_string()]),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err.root_cause(), SniffError::Viewer(_)));
    }
}
