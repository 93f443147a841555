//! HTTP API tests: a real server on a free port, driven with reqwest.

use std::sync::Arc;

use base64::Engine;
use serde_json::{json, Value};
use tempfile::TempDir;

use docflow::config::parse_config;
use docflow::open_pipeline_with;
use docflow::server::serve;
use docflow_core::primitives::Primitives;
use docflow_core::testing::{FlakyOcr, HashEmbedder, ScriptedGenerator};
use docflow_core::worker::WorkerStep;
use docflow_core::Pipeline;

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

struct TestServer {
    _tmp: TempDir,
    base: String,
    pipeline: Pipeline,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let tmp = TempDir::new().unwrap();
        let port = find_free_port();
        let config = parse_config(&format!(
            "[db]\npath = \"{root}/docflow.sqlite\"\n\n[blobs]\nroot = \"{root}/blobs\"\n\n[queue]\nbase_backoff_secs = 0.0\n\n[server]\nbind = \"127.0.0.1:{port}\"\n",
            root = tmp.path().display(),
            port = port,
        ))
        .unwrap();
        let pipeline = open_pipeline_with(
            &config,
            Primitives {
                embedder: Arc::new(HashEmbedder::new()),
                generator: Arc::new(ScriptedGenerator::default_replies()),
                ocr: Arc::new(FlakyOcr::new()),
            },
        )
        .await
        .unwrap();

        let server_pipeline = pipeline.clone();
        let bind = config.server.bind.clone();
        let handle = tokio::spawn(async move {
            serve(server_pipeline, &bind).await.ok();
        });
        wait_for_server(port).await;

        Self {
            _tmp: tmp,
            base: format!("http://127.0.0.1:{}/v1/tenants", port),
            pipeline,
            handle,
        }
    }

    fn url(&self, tenant: &str, path: &str) -> String {
        format!("{}/{}{}", self.base, tenant, path)
    }

    async fn drain(&self, task: docflow_core::models::TaskType) {
        let worker = self.pipeline.worker("http-test");
        while worker.process_one(task).await.unwrap() != WorkerStep::Idle {}
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn upload(client: &reqwest::Client, server: &TestServer, tenant: &str, text: &str) -> Value {
    let resp = client
        .post(server.url(tenant, "/documents"))
        .json(&json!({
            "filename": "memo.txt",
            "mime_type": "text/plain",
            "user_id": "alice",
            "content_base64": base64::engine::general_purpose::STANDARD.encode(text),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    resp.json().await.unwrap()
}

#[tokio::test]
async fn health_reports_version() {
    let server = TestServer::start().await;
    let body: Value = reqwest::get(server.base.replace("/v1/tenants", "/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn upload_process_query_and_review_over_http() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let doc = upload(&client, &server, "acme", "invoice total due march fourteen").await;
    let doc_id = doc["id"].as_str().unwrap().to_string();
    assert_eq!(doc["status"], "uploaded");

    let resp = client
        .post(server.url("acme", &format!("/documents/{}/jobs", doc_id)))
        .json(&json!({ "task_type": "ocr" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let job_id = resp.json::<Value>().await.unwrap()["job_id"]
        .as_str()
        .unwrap()
        .to_string();

    server.drain(docflow_core::models::TaskType::Ocr).await;
    server.drain(docflow_core::models::TaskType::Indexing).await;

    let job: Value = client
        .get(server.url("acme", &format!("/jobs/{}", job_id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["status"], "done");

    let view: Value = client
        .get(server.url("acme", &format!("/documents/{}", doc_id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["status"], "completed");
    assert!(view["tasks"].as_array().unwrap().len() >= 2);

    let answer: Value = client
        .post(server.url("acme", "/query"))
        .json(&json!({ "question": "invoice total due march fourteen" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(answer["status"], "answered");
    assert_eq!(answer["sources"][0]["document_id"], doc_id.as_str());

    let result_url = server.url("acme", &format!("/documents/{}/results/ocr", doc_id));
    let reviewed: Value = client
        .post(format!("{}/review", result_url))
        .json(&json!({
            "user_id": "bob",
            "action": "correct",
            "field": "text",
            "value": "Invoice total due March 14."
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reviewed["review_state"], "reviewed");
    assert_eq!(reviewed["effective"]["text"], "Invoice total due March 14.");

    let audit: Value = client
        .get(server.url("acme", &format!("/audit?document_id={}", doc_id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let actions: Vec<&str> = audit["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["action"].as_str().unwrap())
        .collect();
    assert!(actions.contains(&"document_uploaded"), "{:?}", actions);
    assert!(actions.contains(&"result_corrected"), "{:?}", actions);
}

#[tokio::test]
async fn other_tenants_get_not_found() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let doc = upload(&client, &server, "acme", "private notes").await;
    let doc_id = doc["id"].as_str().unwrap();

    let resp = client
        .get(server.url("globex", &format!("/documents/{}", doc_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = client
        .post(server.url("globex", &format!("/documents/{}/jobs", doc_id)))
        .json(&json!({ "task_type": "summarization" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let doc = upload(&client, &server, "acme", "text").await;
    let doc_id = doc["id"].as_str().unwrap();

    let resp = client
        .post(server.url("acme", "/documents"))
        .json(&json!({
            "filename": "x.txt",
            "mime_type": "text/plain",
            "user_id": "alice",
            "content_base64": "%%% not base64 %%%",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(server.url("acme", &format!("/documents/{}/jobs", doc_id)))
        .json(&json!({ "task_type": "translation" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(server.url("acme", &format!("/documents/{}/jobs", doc_id)))
        .json(&json!({ "task_type": "ocr", "payload": [1, 2] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .get(server.url("acme", &format!("/documents/{}/results/summarization", doc_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn dead_letters_can_be_listed_and_replayed() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    let doc = upload(&client, &server, "acme", "text").await;
    let doc_id = doc["id"].as_str().unwrap();

    // No such template: fails permanently on the first attempt.
    client
        .post(server.url("acme", &format!("/documents/{}/jobs", doc_id)))
        .json(&json!({ "task_type": "form_filling", "payload": { "template": "missing" } }))
        .send()
        .await
        .unwrap();
    server
        .drain(docflow_core::models::TaskType::FormFilling)
        .await;

    let listed: Value = client
        .get(server.url("acme", "/dead-letters"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let letters = listed["dead_letters"].as_array().unwrap();
    assert_eq!(letters.len(), 1);
    let dl_id = letters[0]["id"].as_str().unwrap();

    let resp = client
        .post(server.url("acme", &format!("/dead-letters/{}/replay?user_id=ops", dl_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let job: Value = resp.json().await.unwrap();
    assert_eq!(job["status"], "pending");

    let resp = client
        .post(server.url("acme", &format!("/dead-letters/{}/replay", dl_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let other: Value = client
        .get(server.url("globex", "/dead-letters"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(other["dead_letters"].as_array().unwrap().is_empty());
}
