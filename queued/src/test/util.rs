use std::{
    collections::{BTreeMap, VecDeque},
    convert::Infallible,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

use crate::{
    err::JobExecErr,
    runner::{
        model::{MountPaths, SandboxConfig},
        SandboxRuntime,
    },
};

pub const OUTPUT_GUEST_PATH: &str = "/output";
pub const SUBMISSION_GUEST_PATH: &str = "/submission";

/// What a [`MockRuntime`] sandbox does when executed.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Exit with code 0, printing this to stderr.
    Succeed(String),
    /// Exit with a non-zero code, printing this to stderr.
    Fail(i64, String),
    /// Never exit on its own.
    Hang,
    Panic,
}

/// A sandbox run as observed by a [`MockRuntime`].
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub config: SandboxConfig,
    /// Content of the submission volume at the time of the run.
    pub submission: BTreeMap<String, String>,
}

/// A [`SandboxRuntime`] that pretends to run images, writing prepared files
/// into the output volume.
#[derive(Debug)]
pub struct MockRuntime {
    mount_paths: Result<MountPaths, String>,
    behavior: MockBehavior,
    output_files: Vec<(String, String)>,
    runs: Mutex<Vec<RecordedRun>>,
    pulls: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn new(behavior: MockBehavior) -> MockRuntime {
        MockRuntime {
            mount_paths: Ok(MountPaths {
                output: OUTPUT_GUEST_PATH.into(),
                submission: SUBMISSION_GUEST_PATH.into(),
            }),
            behavior,
            output_files: vec![],
            runs: Mutex::new(vec![]),
            pulls: Mutex::new(vec![]),
        }
    }

    /// Make image introspection fail.
    pub fn without_mount_paths(mut self, reason: &str) -> MockRuntime {
        self.mount_paths = Err(reason.into());
        self
    }

    /// Have the sandbox write `content` to `name` in its output volume.
    pub fn writes(mut self, name: &str, content: &str) -> MockRuntime {
        self.output_files.push((name.into(), content.into()));
        self
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.lock().unwrap().clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.pulls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    async fn pull_image(&self, cfg: &SandboxConfig) -> anyhow::Result<()> {
        self.pulls.lock().unwrap().push(cfg.image.clone());
        Err(anyhow::anyhow!("registry is unreachable in tests"))
    }

    async fn mount_paths(&self, image: &str) -> Result<MountPaths, JobExecErr> {
        self.mount_paths
            .clone()
            .map_err(|reason| JobExecErr::ImageIntrospection {
                image: image.into(),
                reason,
            })
    }

    async fn execute(
        &self,
        cfg: &SandboxConfig,
        cancel: &CancellationToken,
    ) -> Result<String, JobExecErr> {
        let mut submission = BTreeMap::new();
        for vol in &cfg.volumes {
            if vol.guest_path == SUBMISSION_GUEST_PATH {
                for entry in std::fs::read_dir(&vol.host_path).unwrap() {
                    let entry = entry.unwrap();
                    submission.insert(
                        entry.file_name().to_string_lossy().into_owned(),
                        std::fs::read_to_string(entry.path()).unwrap(),
                    );
                }
            } else if vol.guest_path == OUTPUT_GUEST_PATH {
                for (name, content) in &self.output_files {
                    let path = vol.host_path.join(name);
                    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                    std::fs::write(path, content).unwrap();
                }
            }
        }
        self.runs.lock().unwrap().push(RecordedRun {
            config: cfg.clone(),
            submission,
        });

        match &self.behavior {
            MockBehavior::Succeed(stderr) => Ok(stderr.clone()),
            MockBehavior::Fail(code, stderr) => Err(JobExecErr::SandboxExit {
                code: Some(*code),
                detail: format!("exit code {}", code),
                stderr: stderr.clone(),
            }),
            MockBehavior::Hang => {
                tokio::select! {
                    _ = tokio::time::sleep(cfg.deadline()) => Err(JobExecErr::SandboxTimeout {
                        secs: cfg.timeout.as_secs(),
                    }),
                    _ = cancel.cancelled() => Err(JobExecErr::Cancelled),
                }
            }
            MockBehavior::Panic => panic!("sandbox exploded"),
        }
    }

    fn name(&self) -> std::borrow::Cow<'static, str> {
        "mock".into()
    }
}

/// A request received by a [`TestServer`].
#[derive(Debug)]
pub struct Received {
    pub method: hyper::Method,
    pub path: String,
    pub body: String,
}

impl Received {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

/// An HTTP server answering from a list of prepared responses, falling back
/// to a fixed status once the list is used up.
pub struct TestServer {
    pub addr: SocketAddr,
    pub received: UnboundedReceiver<Received>,
}

impl TestServer {
    pub fn start(fallback: StatusCode, prepared: Vec<(StatusCode, String)>) -> TestServer {
        let (tx, rx) = unbounded_channel();
        let prepared = Arc::new(Mutex::new(VecDeque::from(prepared)));

        let make_svc = make_service_fn(move |_conn| {
            let tx = tx.clone();
            let prepared = prepared.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let tx = tx.clone();
                    let prepared = prepared.clone();
                    async move {
                        let method = req.method().clone();
                        let path = req.uri().path().to_owned();
                        let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
                        let _ = tx.send(Received {
                            method,
                            path,
                            body: String::from_utf8_lossy(&body).into_owned(),
                        });

                        let (status, body) = prepared
                            .lock()
                            .unwrap()
                            .pop_front()
                            .unwrap_or((fallback, String::new()));
                        let mut res = Response::new(Body::from(body));
                        *res.status_mut() = status;
                        Ok::<_, Infallible>(res)
                    }
                }))
            }
        });

        let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        TestServer { addr, received: rx }
    }

    /// A server that accepts every request with `200 OK`.
    pub fn capture() -> TestServer {
        TestServer::start(StatusCode::OK, vec![])
    }

    pub async fn next(&mut self) -> Received {
        tokio::time::timeout(Duration::from_secs(10), self.received.recv())
            .await
            .expect("timed out waiting for a request")
            .expect("server stopped")
    }

    /// Assert that nothing arrives within `wait`.
    pub async fn expect_nothing(&mut self, wait: Duration) {
        if let Ok(Some(req)) = tokio::time::timeout(wait, self.received.recv()).await {
            panic!("unexpected request: {:?}", req);
        }
    }
}

/// A job document for `return_url`.
pub fn job_json(return_url: &str, meta: &str) -> String {
    format!(
        r#"{{"returnUrl": "{}", "dockerImage": "grader:latest", "files": {{"main.cpp": "int main(){{}}"}}, "maxRunTime": 5, "memory": 64, "metaData": {}}}"#,
        return_url, meta
    )
}
