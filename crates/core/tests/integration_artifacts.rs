//! Artifact download, cache index and staging setup
//!
//! HTTP sources are served by wiremock; local sources are plain files.

use sidecars_core::config::{LaunchConfig, SidecarSpec};
use sidecars_core::errors::{FetchError, SidecarsError};
use sidecars_core::fetcher::{extract, sha1_hex, ArchiveKind, ArtifactFetcher};
use sidecars_core::index::{ArtifactIndex, DownloadDecision};
use sidecars_core::launcher::Launcher;
use sidecars_core::output::OutputSinks;
use sidecars_core::retry::RetryConfig;
use sidecars_core::starter::{Local, Starter};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn tar_gz(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data, mode) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn fast_fetcher() -> ArtifactFetcher {
    ArtifactFetcher::with_retry(RetryConfig {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    })
    .unwrap()
}

fn quiet_sinks() -> OutputSinks {
    OutputSinks::new(
        Arc::new(Mutex::new(std::io::sink())),
        Arc::new(Mutex::new(std::io::sink())),
    )
}

fn config(dir: &Path, sidecars: Vec<SidecarSpec>) -> LaunchConfig {
    let mut config = LaunchConfig::new(sidecars);
    config.dir = Some(dir.to_path_buf());
    config
}

#[tokio::test]
async fn test_fetch_retries_transient_errors() {
    let server = MockServer::start().await;
    let body = tar_gz(&[("agent", b"#!/bin/sh\n", 0o755)]);
    Mock::given(method("GET"))
        .and(path("/agent.tgz"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/agent.tgz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let target = tmp.path().join("agent.tgz");
    let session = fast_fetcher()
        .fetch(
            &target,
            &format!("{}/agent.tgz", server.uri()),
            None,
            Some(&sha1_hex(&body)),
        )
        .await
        .unwrap();
    assert_eq!(session.kind(), ArchiveKind::TarGz);
    assert_eq!(fs::read(&target).unwrap(), body);
}

#[tokio::test]
async fn test_fetch_does_not_retry_client_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.zip"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let target = tmp.path().join("missing.zip");
    let err = fast_fetcher()
        .fetch(&target, &format!("{}/missing.zip", server.uri()), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SidecarsError::Fetch(FetchError::Download { .. })));
    assert!(!target.exists());
}

#[tokio::test]
async fn test_fetch_rejects_hash_mismatch_before_writing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/agent.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(zip_bytes(&[("a", "b")])))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let target = tmp.path().join("agent.zip");
    let err = fast_fetcher()
        .fetch(
            &target,
            &format!("{}/agent.zip", server.uri()),
            None,
            Some("0000000000000000000000000000000000000000"),
        )
        .await
        .unwrap_err();
    assert!(err.is_verification());
    assert!(!target.exists());
}

#[test]
fn test_extract_rejects_traversal() {
    let tmp = TempDir::new().unwrap();
    let archive = tmp.path().join("evil.tar");
    {
        let mut builder = tar::Builder::new(fs::File::create(&archive).unwrap());
        let mut header = tar::Header::new_old();
        let name = b"../escape.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(4);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &b"evil"[..]).unwrap();
        builder.finish().unwrap();
    }

    let dest = tmp.path().join("out");
    let err = extract(&archive, ArchiveKind::Tar, &dest).unwrap_err();
    assert!(matches!(err, FetchError::PathTraversal { .. }));
    assert!(!tmp.path().join("escape.txt").exists());
}

#[cfg(unix)]
#[test]
fn test_extract_keeps_modes() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = TempDir::new().unwrap();
    let archive = tmp.path().join("agent.tgz");
    fs::write(
        &archive,
        tar_gz(&[("bin/agent", b"#!/bin/sh\n", 0o755), ("conf/a.yml", b"a: 1\n", 0o644)]),
    )
    .unwrap();

    let dest = tmp.path().join("out");
    extract(&archive, ArchiveKind::TarGz, &dest).unwrap();
    let mode = fs::metadata(dest.join("bin/agent")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
    assert_eq!(fs::read_to_string(dest.join("conf/a.yml")).unwrap(), "a: 1\n");
}

#[test]
fn test_index_round_trip_and_decisions() {
    let tmp = TempDir::new().unwrap();
    let index_path = tmp.path().join(".sidecars/index.yml");
    let spec = SidecarSpec::new("agent", "agent")
        .unwrap()
        .with_artifact("http://h/agent.zip", None, Some("abc"));

    let mut index = ArtifactIndex::load(&index_path).unwrap();
    assert!(index.is_empty());
    assert_eq!(index.should_download(&spec), DownloadDecision::Download);
    index.record(&spec, ".cache/agent.zip");
    index.persist().unwrap();

    let reloaded = ArtifactIndex::load(&index_path).unwrap();
    assert_eq!(reloaded.should_download(&spec), DownloadDecision::UpToDate);
    let entry = reloaded.lookup("agent").unwrap();
    assert_eq!(entry.uri, "http://h/agent.zip");
    assert_eq!(entry.sha1, "abc");

    let unpinned = SidecarSpec::new("agent", "agent")
        .unwrap()
        .with_artifact("http://h/agent.zip", None, None);
    assert_eq!(reloaded.should_download(&unpinned), DownloadDecision::Download);

    let drifted = SidecarSpec::new("agent", "agent")
        .unwrap()
        .with_artifact("http://h/agent.zip", None, Some("def"));
    assert!(reloaded.should_download(&drifted).reason().is_some());

    let moved = SidecarSpec::new("agent", "agent")
        .unwrap()
        .with_artifact("http://h/v2/agent.zip", None, Some("def"));
    assert_eq!(reloaded.should_download(&moved), DownloadDecision::Download);

    let other = SidecarSpec::new("other", "other").unwrap();
    let stale = reloaded.reconcile(&[other]);
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].name, "agent");
}

#[test]
fn test_corrupt_index_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let sidecars = tmp.path().join(".sidecars");
    fs::create_dir_all(&sidecars).unwrap();
    fs::write(sidecars.join("index.yml"), "{not: [a list").unwrap();

    let err = Launcher::new(config(tmp.path(), Vec::new()), None, tmp.path(), 8080).unwrap_err();
    assert!(matches!(err, SidecarsError::Cache(_)));
}

#[tokio::test]
async fn test_download_skips_populated_dirs_and_continues() {
    let tmp = TempDir::new().unwrap();
    let archives = TempDir::new().unwrap();
    let mut sidecars = Vec::new();
    for name in ["first", "second", "third"] {
        let archive = archives.path().join(format!("{}.zip", name));
        fs::write(&archive, zip_bytes(&[("run", name)])).unwrap();
        sidecars.push(
            SidecarSpec::new(name, "run")
                .unwrap()
                .with_artifact(archive.display().to_string(), None, None),
        );
    }
    let first_dir = tmp.path().join(".sidecars/first");
    fs::create_dir_all(&first_dir).unwrap();
    fs::write(first_dir.join("existing"), "x").unwrap();

    let mut launcher = Launcher::new(config(tmp.path(), sidecars), None, tmp.path(), 8080)
        .unwrap()
        .with_output(quiet_sinks());
    launcher.download_artifacts(false).await.unwrap();

    assert!(!first_dir.join("run").exists());
    for name in ["second", "third"] {
        let run = tmp.path().join(".sidecars").join(name).join("run");
        assert_eq!(fs::read_to_string(run).unwrap(), name);
        assert!(launcher.index().lookup(name).is_none());
    }
}

#[tokio::test]
async fn test_failed_extraction_does_not_poison_the_cache() {
    let tmp = TempDir::new().unwrap();
    let archives = TempDir::new().unwrap();
    let source = archives.path().join("a.zip");
    fs::write(&source, "<html>maintenance</html>").unwrap();
    let spec = SidecarSpec::new("a", "run")
        .unwrap()
        .with_artifact(source.display().to_string(), None, None);

    let mut launcher = Launcher::new(config(tmp.path(), vec![spec]), None, tmp.path(), 8080)
        .unwrap()
        .with_output(quiet_sinks());
    let err = launcher.download_artifacts(false).await.unwrap_err();
    assert_eq!(err.sidecar_name(), Some("a"));

    let sidecars_dir = tmp.path().join(".sidecars");
    assert!(launcher.index().lookup("a").is_none());
    assert!(!sidecars_dir.join(".cache/a.zip").exists());
    assert!(!sidecars_dir.join("a").exists());

    fs::write(&source, zip_bytes(&[("run", "fixed")])).unwrap();
    launcher.download_artifacts(false).await.unwrap();
    assert_eq!(
        fs::read_to_string(sidecars_dir.join("a/run")).unwrap(),
        "fixed"
    );
}

#[test]
fn test_sidecar_name_cannot_leave_sidecars_dir() {
    let tmp = TempDir::new().unwrap();
    let precious = tmp.path().join("victim");
    fs::create_dir_all(&precious).unwrap();
    let config_path = tmp.path().join("sidecars-config.yml");
    fs::write(
        &config_path,
        "sidecars:\n  - name: ../victim\n    executable: run\n    artifact_uri: /nonexistent/a.zip\n",
    )
    .unwrap();

    let err = LaunchConfig::load(&config_path).unwrap_err();
    assert!(err.to_string().contains("Invalid sidecar name"));
    assert!(precious.is_dir());
}

#[tokio::test]
async fn test_download_removes_stale_entries() {
    let tmp = TempDir::new().unwrap();
    let sidecars_dir = tmp.path().join(".sidecars");
    fs::create_dir_all(sidecars_dir.join(".cache")).unwrap();
    fs::create_dir_all(sidecars_dir.join("gone")).unwrap();
    fs::write(sidecars_dir.join(".cache/gone.zip"), "old").unwrap();
    fs::write(
        sidecars_dir.join("index.yml"),
        "- name: gone\n  uri: http://h/gone.zip\n  sha1: ''\n  archive_path: .cache/gone.zip\n",
    )
    .unwrap();

    let mut launcher = Launcher::new(config(tmp.path(), Vec::new()), None, tmp.path(), 8080)
        .unwrap()
        .with_output(quiet_sinks());
    launcher.download_artifacts(false).await.unwrap();

    assert!(!sidecars_dir.join(".cache/gone.zip").exists());
    assert!(!sidecars_dir.join("gone").exists());
    assert!(ArtifactIndex::load(sidecars_dir.join("index.yml"))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_hash_drift_is_a_verification_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let uri = format!("{}/agent.zip", server.uri());
    let sidecars_dir = tmp.path().join(".sidecars");
    fs::create_dir_all(&sidecars_dir).unwrap();
    fs::write(
        sidecars_dir.join("index.yml"),
        format!("- name: agent\n  uri: {uri}\n  sha1: aaaa\n  archive_path: .cache/agent.zip\n"),
    )
    .unwrap();

    let spec = SidecarSpec::new("agent", "agent")
        .unwrap()
        .with_artifact(&uri, None, Some("bbbb"));
    let mut launcher = Launcher::new(config(tmp.path(), vec![spec]), None, tmp.path(), 8080)
        .unwrap()
        .with_fetcher(fast_fetcher())
        .with_output(quiet_sinks());

    let err = launcher.download_artifacts(false).await.unwrap_err();
    assert!(err.is_verification());
    assert_eq!(err.sidecar_name(), Some("agent"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_setup_downloads_and_writes_profiles() {
    let server = MockServer::start().await;
    let body = tar_gz(&[("bin/agent", b"#!/bin/sh\necho agent\n", 0o755)]);
    Mock::given(method("GET"))
        .and(path("/agent.tgz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let agent = SidecarSpec::new("agent", "bin/agent")
        .unwrap()
        .with_artifact(
            format!("{}/agent.tgz", server.uri()),
            None,
            Some(&sha1_hex(&body)),
        )
        .with_after_install("touch installed")
        .with_profiled("export AGENT_HOME=/app/.sidecars/agent")
        .with_app_env([("AGENT_URL", "http://localhost:9000")]);
    let proxy = SidecarSpec::new("proxy", "/bin/true")
        .unwrap()
        .with_rproxy(true)
        .with_app_env([("UPSTREAM", "${AGENT_URL}/api")]);

    let starter: Arc<dyn Starter> = Arc::new(Local::new(tmp.path()));
    let profile_dir = tmp.path().join("profile.d");
    let mut launcher = Launcher::new(
        config(tmp.path(), vec![agent, proxy]),
        Some(starter),
        &profile_dir,
        8080,
    )
    .unwrap()
    .with_fetcher(fast_fetcher())
    .with_output(quiet_sinks());
    let base_port = launcher.app_port();

    launcher.setup(false).await.unwrap();

    let agent_dir = tmp.path().join(".sidecars/agent");
    assert!(agent_dir.join("bin/agent").is_file());
    assert!(agent_dir.join("bin/installed").is_file());
    assert!(!tmp.path().join(".sidecars/.cache/agent.tgz").exists());

    assert_eq!(
        fs::read_to_string(profile_dir.join("agent.sh")).unwrap(),
        "export AGENT_HOME=/app/.sidecars/agent"
    );
    let starter_sh = fs::read_to_string(profile_dir.join("starter.sh")).unwrap();
    assert!(starter_sh.contains("export AGENT_URL=http://localhost:9000\n"), "{starter_sh}");
    assert!(starter_sh.contains("export UPSTREAM=http://localhost:9000/api\n"), "{starter_sh}");
    assert!(starter_sh.contains(&format!("export PORT={}\n", base_port + 1)), "{starter_sh}");
    assert!(starter_sh.contains(&format!("export SIDECAR_APP_PORT={}\n", base_port)), "{starter_sh}");

    // A second run finds the directory populated and fetches nothing
    launcher.setup(false).await.unwrap();
}
