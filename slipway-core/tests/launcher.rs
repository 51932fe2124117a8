//! Integration tests for launching built images.
//!
//! Each test builds the fixture project, then launches it with host
//! isolation on a free loopback port.

mod common;

use common::{read_lines, Fixture};
use slipway_core::{LaunchOptions, Launcher, SlipwayError};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn loopback(port: u16) -> LaunchOptions {
    LaunchOptions { port: Some(port), address: Some("127.0.0.1".parse().unwrap()), isolation: None }
}

fn launcher(fixture: &Fixture) -> Launcher {
    Launcher::new(&fixture.config, &fixture.paths).unwrap().with_startup_timeout(Duration::from_millis(300))
}

#[tokio::test]
async fn test_launch_runs_entry_with_bind_flags() {
    let fixture = Fixture::new();
    let args_file = fixture.temp.path().join("args.txt");
    fixture.write("app.sh", &format!("pwd > {out}\necho \"$@\" >> {out}\nexit 7\n", out = args_file.display()));
    fixture.build().await.unwrap();

    let port = free_port();
    let outcome = launcher(&fixture).run(&fixture.reference(), &loopback(port)).await.unwrap();

    assert_eq!(outcome.exit_code, 7);
    assert_eq!(outcome.endpoint.port, port);

    let lines = read_lines(&args_file);
    assert!(lines[0].ends_with("/rootfs/app"), "cwd: {}", lines[0]);
    assert_eq!(lines[1], format!("--server.port={} --server.address=127.0.0.1", port));

    // Per-run root filesystem is gone once the process exits
    assert!(!fixture.paths.containers_dir().join(&outcome.container_id).exists());
}

#[tokio::test]
async fn test_shell_form_command_receives_bind_flags() {
    let fixture = Fixture::new();
    let args_file = fixture.temp.path().join("args.txt");
    fixture.write("app.sh", &format!("echo \"$@\" > {}\n", args_file.display()));
    fixture.write_recipe_with_cmd("RUN true", "CMD sh app.sh --server.port=8501");
    fixture.build().await.unwrap();

    let port = free_port();
    let outcome = launcher(&fixture).run(&fixture.reference(), &loopback(port)).await.unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.endpoint.port, port);
    assert_eq!(read_lines(&args_file), vec![format!("--server.port={} --server.address=127.0.0.1", port)]);
}

#[tokio::test]
async fn test_shell_form_missing_entry_is_reported() {
    let fixture = Fixture::new();
    fixture.write_recipe_with_cmd("RUN true", "CMD streamlit run main.py --server.port=8501");
    fixture.build().await.unwrap();

    let err = launcher(&fixture).run(&fixture.reference(), &loopback(free_port())).await.unwrap_err();
    assert!(matches!(err, SlipwayError::EntryNotFound { ref entry, .. } if entry == "main.py"), "{}", err);
}

#[tokio::test]
async fn test_launch_passes_image_environment() {
    let fixture = Fixture::new();
    let env_file = fixture.temp.path().join("env.txt");
    fixture.write("app.sh", &format!("echo \"$DASHBOARD_TITLE\" > {}\n", env_file.display()));
    fixture.write_recipe_with_cmd(
        "RUN true",
        "ENV DASHBOARD_TITLE=Sales\nCMD [\"sh\", \"app.sh\"]",
    );
    fixture.build().await.unwrap();

    let outcome = launcher(&fixture).run(&fixture.reference(), &loopback(free_port())).await.unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(read_lines(&env_file), vec!["Sales"]);
}

#[tokio::test]
async fn test_missing_entry_fails_without_starting() {
    let fixture = Fixture::new();
    let marker = fixture.temp.path().join("started");
    fixture.write_recipe_with_cmd("RUN true", &format!("CMD [\"sh\", \"-c\", \"touch {}\", \"main.py\"]", marker.display()));
    fixture.build().await.unwrap();

    let port = free_port();
    let err = launcher(&fixture).run(&fixture.reference(), &loopback(port)).await.unwrap_err();

    match &err {
        SlipwayError::EntryNotFound { entry, workdir } => {
            assert_eq!(entry, "main.py");
            assert_eq!(workdir, "/app");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_ne!(err.exit_code(), 0);
    assert!(!marker.exists());

    // Nothing is listening on the port
    assert!(std::net::TcpStream::connect(("127.0.0.1", port)).is_err());
}

#[tokio::test]
async fn test_port_in_use_is_reported() {
    let fixture = Fixture::new();
    fixture.write("app.sh", "exit 0\n");
    fixture.build().await.unwrap();

    let held = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = held.local_addr().unwrap().port();

    let err = launcher(&fixture).run(&fixture.reference(), &loopback(port)).await.unwrap_err();
    assert!(matches!(err, SlipwayError::PortConflict { port: p, .. } if p == port), "{}", err);
    assert!(err.to_string().contains(&port.to_string()));
    assert_eq!(err.exit_code(), 125);
}

/// Stand-in dashboard server. Does nothing in a normal test run; when the
/// launched entry script re-executes this test binary with `SERVE_PORT`
/// set, it listens on the wildcard address until a client sends `stop`.
#[test]
fn serve_stand_in() {
    let Ok(port) = std::env::var("SERVE_PORT") else { return };
    let listener = TcpListener::bind(("0.0.0.0", port.parse::<u16>().unwrap())).unwrap();

    std::thread::spawn(|| {
        std::thread::sleep(Duration::from_secs(20));
        std::process::exit(2);
    });

    for stream in listener.incoming() {
        let mut stream = stream.unwrap();
        let mut buf = [0u8; 4];
        // Readiness checks connect and hang up without sending anything
        if stream.read_exact(&mut buf).is_ok() && &buf == b"stop" {
            stream.write_all(b"bye").unwrap();
            std::process::exit(0);
        }
    }
}

#[tokio::test]
async fn test_launched_server_accepts_connections_on_wildcard() {
    let fixture = Fixture::new();
    let exe = std::env::current_exe().unwrap();
    fixture.write(
        "app.sh",
        &format!(
            "for arg in \"$@\"; do case \"$arg\" in --server.port=*) port=\"${{arg#--server.port=}}\";; esac; done\n\
             SERVE_PORT=\"$port\" exec {} serve_stand_in --exact --nocapture\n",
            exe.display()
        ),
    );
    fixture.build().await.unwrap();

    let port = free_port();
    let options = LaunchOptions { port: Some(port), address: None, isolation: None };
    let launcher = Launcher::new(&fixture.config, &fixture.paths).unwrap().with_startup_timeout(Duration::from_secs(10));

    let client = tokio::spawn(async move {
        let deadline = Instant::now() + Duration::from_secs(15);
        let mut connected = false;
        while Instant::now() < deadline {
            match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
                // Give the readiness watch time to see the listener too
                Ok(stream) if !connected => {
                    drop(stream);
                    connected = true;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Ok(mut stream) => {
                    stream.write_all(b"stop").await.unwrap();
                    let mut reply = Vec::new();
                    let _ = stream.read_to_end(&mut reply).await;
                    if reply == b"bye" {
                        return true;
                    }
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
        false
    });

    let outcome = launcher.run(&fixture.reference(), &options).await.unwrap();

    assert!(client.await.unwrap(), "server never accepted a connection");
    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.endpoint.address.is_unspecified());
    assert_eq!(outcome.endpoint.port, port);
    assert!(outcome.ready_after.is_some());
}
