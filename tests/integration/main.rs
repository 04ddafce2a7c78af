//! Integration tests for buildsmith

mod cli_tests {
    use assert_cmd::Command;
    use predicates::prelude::*;

    fn buildsmith() -> Command {
        Command::cargo_bin("buildsmith").unwrap()
    }

    #[test]
    fn help_displays() {
        buildsmith()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Build service for the Vessel core"));
    }

    #[test]
    fn version_displays() {
        buildsmith()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("buildsmith"));
    }

    #[test]
    fn help_lists_flags() {
        buildsmith()
            .arg("--help")
            .assert()
            .success()
            .stdout(
                predicate::str::contains("--addr")
                    .and(predicate::str::contains("--uid"))
                    .and(predicate::str::contains("--chroot"))
                    .and(predicate::str::contains("--parallel-build-ops")),
            );
    }

    #[test]
    fn bad_uid_rejected() {
        buildsmith()
            .args(["--uid", "-2", "--addr", "127.0.0.1:0"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("bad uid/gid"));
    }

    #[test]
    fn uid_above_u32_rejected() {
        buildsmith()
            .args(["--uid", "4294967296", "--addr", "127.0.0.1:0"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("bad uid/gid"));
    }

    #[test]
    fn unknown_flag_rejected() {
        buildsmith().arg("--nope").assert().failure();
    }
}

mod service_tests {
    use std::io::Read;
    use std::net::TcpStream;
    use std::process::{Child, Command, Stdio};
    use std::time::{Duration, Instant};

    /// Serve on an ephemeral port in a scratch directory (no signing key
    /// there, so signing is disabled but startup succeeds), and report
    /// the bound address from the startup banner.
    struct Service {
        child: Child,
        addr: String,
        _dir: tempfile::TempDir,
    }

    impl Service {
        fn start() -> Self {
            let dir = tempfile::TempDir::new().unwrap();
            let mut child = Command::new(env!("CARGO_BIN_EXE_buildsmith"))
                .args(["--addr", "127.0.0.1:0", "--log", "stderr"])
                .current_dir(dir.path())
                .env("BUILDSMITH_CLIENT_ID", "test")
                .env("BUILDSMITH_CLIENT_KEY", "test-key")
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .unwrap();

            // "buildsmith serving on 127.0.0.1:0" is printed after bind;
            // with port 0 we must probe the real port via /proc-free retry
            let mut banner = String::new();
            let mut stdout = child.stdout.take().unwrap();
            let deadline = Instant::now() + Duration::from_secs(10);
            let mut buf = [0u8; 256];
            while Instant::now() < deadline && !banner.contains("serving on") {
                match stdout.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => banner.push_str(&String::from_utf8_lossy(&buf[..n])),
                    Err(_) => break,
                }
            }
            let addr = banner
                .rsplit("serving on ")
                .next()
                .unwrap()
                .trim()
                .to_string();
            Self {
                child,
                addr,
                _dir: dir,
            }
        }

        fn request(&self, raw: &str) -> String {
            use std::io::Write;
            let mut stream = TcpStream::connect(&self.addr).unwrap();
            stream.write_all(raw.as_bytes()).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            let mut response = String::new();
            let _ = stream.read_to_string(&mut response);
            response
        }
    }

    impl Drop for Service {
        fn drop(&mut self) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }

    fn basic_auth() -> String {
        // base64("test:test-key")
        "dGVzdDp0ZXN0LWtleQ==".to_string()
    }

    #[test]
    #[ignore = "binds a socket; spawns the service binary"]
    fn unauthenticated_requests_are_rejected() {
        let service = Service::start();
        let response = service.request(
            "GET /supported-platforms HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 401"));
    }

    #[test]
    #[ignore = "binds a socket; spawns the service binary; needs a Go toolchain"]
    fn supported_platforms_excludes_denylist() {
        let service = Service::start();
        let response = service.request(&format!(
            "GET /supported-platforms HTTP/1.1\r\nHost: localhost\r\nAuthorization: Basic {}\r\nConnection: close\r\n\r\n",
            basic_auth()
        ));
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""GOOS":"linux""#));
        assert!(!response.contains(r#""GOOS":"plan9""#));
    }

    #[test]
    #[ignore = "binds a socket; spawns the service binary"]
    fn wrong_method_is_rejected() {
        let service = Service::start();
        let response = service.request(&format!(
            "GET /build HTTP/1.1\r\nHost: localhost\r\nAuthorization: Basic {}\r\nConnection: close\r\n\r\n",
            basic_auth()
        ));
        assert!(response.starts_with("HTTP/1.1 405"));
    }

    #[test]
    #[ignore = "binds a socket; spawns the service binary"]
    fn build_with_missing_fields_is_rejected() {
        let service = Service::start();
        let body = r#"{"core_version":"master"}"#;
        let response = service.request(&format!(
            "POST /build HTTP/1.1\r\nHost: localhost\r\nAuthorization: Basic {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            basic_auth(),
            body.len(),
            body
        ));
        assert!(response.starts_with("HTTP/1.1 400"));
    }
}
