//! HTTP surface tests driven through the router without binding a socket.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use std::sync::Arc;
use task_settlement::api::{AppState, build_router};
use task_settlement::app::{App, ChainBackend};
use task_settlement::chain::MemoryLedger;
use task_settlement::config::Config;
use task_settlement::db::Database;
use tempfile::TempDir;
use tower::ServiceExt;

const WEI: u128 = 1_000_000_000_000_000_000;
const WALLET: &str = "0x00000000000000000000000000000000000000B2";

struct TestApi {
    router: Router,
    ledger: Arc<MemoryLedger>,
    blobs: TempDir,
}

fn setup() -> TestApi {
    let blobs = TempDir::new().expect("Failed to create temp dir");
    let mut config = Config::default();
    config.server.blob_dir = blobs.path().to_path_buf();

    let db = Database::open_in_memory().expect("Failed to create in-memory database");
    let chain = ChainBackend::from_config(&config.chain).expect("Failed to build chain backend");
    let app = App::assemble(db, chain, &config);
    let ledger = app.ledger.clone().expect("memory mode exposes its ledger");

    TestApi {
        router: build_router(AppState::new(app.lifecycle, app.blobs).with_ledger(app.ledger)),
        ledger,
        blobs,
    }
}

impl TestApi {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn create_task(&self, body: Value) -> String {
        let (status, task) = self.post("/tasks", body).await;
        assert_eq!(status, StatusCode::CREATED, "{}", task);
        task["id"].as_str().unwrap().to_string()
    }
}

fn task_body(budget: f64, target: &str) -> Value {
    json!({
        "capability": "restaurant_booking",
        "goal": "Book a table for two",
        "budgetAmount": budget,
        "slaSeconds": 600,
        "target": target,
    })
}

#[tokio::test]
async fn health_reports_ok() {
    let api = setup();
    let (status, body) = api.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

mod task_routes {
    use super::*;

    #[tokio::test]
    async fn create_validates_required_fields() {
        let api = setup();
        let (status, body) = api.post("/tasks", json!({ "goal": "x" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MISSING_REQUIRED_FIELD");
        assert_eq!(body["field"], "capability");
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let api = setup();
        let (status, body) = api
            .send(
                Request::post("/tasks")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{nope"))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_FIELD_VALUE");
    }

    #[tokio::test]
    async fn created_task_is_posted_with_hash() {
        let api = setup();
        let id = api.create_task(task_body(2.5, "human")).await;

        let (status, detail) = api.get(&format!("/tasks/{}", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["status"], "POSTED");
        assert!(detail["task_hash"].as_str().unwrap().starts_with("0x"));
        assert_eq!(detail["events"][0]["action"], "POST");
        assert_eq!(detail["events"][0]["from_status"], "DRAFT");
        assert!(detail["proof"].is_null());
    }

    #[tokio::test]
    async fn unknown_task_is_404() {
        let api = setup();
        let (status, body) = api.get("/tasks/does-not-exist").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "TASK_NOT_FOUND");
    }

    #[tokio::test]
    async fn list_filters_by_status_case_insensitively() {
        let api = setup();
        api.create_task(task_body(0.0, "human")).await;
        let claimed = api.create_task(task_body(0.0, "human")).await;
        let (status, _) = api
            .post(
                &format!("/tasks/{}/claim", claimed),
                json!({ "walletAddress": WALLET }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, tasks) = api.get("/tasks?status=in_progress").await;
        assert_eq!(status, StatusCode::OK);
        let tasks = tasks.as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["id"], claimed.as_str());

        let (status, body) = api.get("/tasks?status=shipped").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "status");
    }

    #[tokio::test]
    async fn invalid_transition_is_409() {
        let api = setup();
        let id = api.create_task(task_body(0.0, "human")).await;

        let (status, body) = api
            .post(&format!("/tasks/{}/verify", id), json!({}))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn early_refund_is_409() {
        let api = setup();
        let id = api.create_task(task_body(0.0, "human")).await;
        api.post(
            &format!("/tasks/{}/claim", id),
            json!({ "walletAddress": WALLET }),
        )
        .await;

        let (status, body) = api
            .send(
                Request::post(format!("/tasks/{}/refund", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "SLA_NOT_EXPIRED");
    }

    #[tokio::test]
    async fn poll_requires_status() {
        let api = setup();
        let id = api.create_task(task_body(0.0, "human")).await;

        let (status, body) = api.get(&format!("/tasks/{}/poll", id)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MISSING_REQUIRED_FIELD");

        let (status, body) = api.get(&format!("/tasks/{}/poll?status=posted", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
        assert_eq!(body["task"]["id"], id.as_str());

        let (_, body) = api.get(&format!("/tasks/{}/poll?status=CLOSED", id)).await;
        assert_eq!(body["ready"], false);
        assert_eq!(body["currentStatus"], "POSTED");
    }

    #[tokio::test]
    async fn funded_agent_flow_over_http() {
        let api = setup();
        let id = api.create_task(task_body(1.0, "agent")).await;

        let (status, provider) = api
            .post(
                "/providers",
                json!({
                    "name": "Table Finder",
                    "walletAddress": WALLET,
                    "capabilityIds": ["restaurant_booking"],
                    "price": 1.0,
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let provider_id = provider["id"].as_str().unwrap().to_string();
        api.ledger.set_stake(WALLET, 2 * WEI);

        let deposit = api
            .ledger
            .record_deposit("0x00000000000000000000000000000000000000a1", WEI);
        let (status, task) = api
            .post(
                &format!("/tasks/{}/fund", id),
                json!({ "depositTxHash": deposit }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", task);
        assert!(task["escrow_tx"].is_string());

        let (status, again) = api
            .post(
                &format!("/tasks/{}/fund", id),
                json!({ "depositTxHash": deposit }),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(again["code"], "ESCROW_ALREADY_FUNDED");

        let (status, task) = api
            .post(
                &format!("/tasks/{}/match", id),
                json!({ "providerId": provider_id }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", task);
        assert_eq!(task["status"], "ESCROWED");

        let (status, task) = api
            .send(
                Request::post(format!("/tasks/{}/accept", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["status"], "IN_PROGRESS");

        let (status, submitted) = api
            .post(
                &format!("/tasks/{}/proof", id),
                json!({
                    "artifacts": [{ "type": "confirmation_code", "value": "ABC123" }],
                    "notes": "Booked",
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(submitted["task"]["status"], "PROOF_SUBMITTED");
        assert_eq!(submitted["proof"]["verification_status"], "pending");

        let (status, task) = api
            .send(
                Request::post(format!("/tasks/{}/verify", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", task);
        assert_eq!(task["status"], "CLOSED");
        assert!(task["payout_tx"].is_string());
    }

    #[tokio::test]
    async fn invalid_deposit_is_400() {
        let api = setup();
        let id = api.create_task(task_body(1.0, "agent")).await;
        let deposit = api
            .ledger
            .record_deposit("0x00000000000000000000000000000000000000a1", WEI / 2);

        let (status, body) = api
            .post(
                &format!("/tasks/{}/fund", id),
                json!({ "depositTxHash": deposit }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "DEPOSIT_INVALID");
        assert_eq!(body["field"], "depositTxHash");
    }
}

mod provider_routes {
    use super::*;

    #[tokio::test]
    async fn create_normalizes_wallet_and_applies_defaults() {
        let api = setup();
        let (status, provider) = api
            .post(
                "/providers",
                json!({ "name": "Runner", "walletAddress": WALLET, "capabilityIds": ["errands"] }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(provider["wallet_address"], WALLET.to_ascii_lowercase());
        assert_eq!(provider["eta_minutes"], 60);
        assert_eq!(provider["rating"], 5.0);
    }

    #[tokio::test]
    async fn rejects_bad_wallet() {
        let api = setup();
        let (status, body) = api
            .post("/providers", json!({ "name": "Runner", "walletAddress": "0x12" }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "walletAddress");
    }

    #[tokio::test]
    async fn list_filters_by_capability() {
        let api = setup();
        api.post(
            "/providers",
            json!({ "name": "A", "walletAddress": WALLET, "capabilityIds": ["errands"] }),
        )
        .await;
        api.post(
            "/providers",
            json!({ "name": "B", "walletAddress": WALLET, "capabilityIds": ["delivery"] }),
        )
        .await;

        let (status, providers) = api.get("/providers?capability=delivery").await;
        assert_eq!(status, StatusCode::OK);
        let providers = providers.as_array().unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0]["name"], "B");

        let (_, all) = api.get("/providers").await;
        assert_eq!(all.as_array().unwrap().len(), 2);
    }
}

mod memory_ledger_routes {
    use super::*;

    #[tokio::test]
    async fn declared_stake_and_deposit_drive_a_funded_match() {
        let api = setup();

        let (status, staked) = api
            .post(
                "/providers",
                json!({ "name": "Staked", "walletAddress": WALLET, "stakeAmount": 20.0 }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", staked);
        assert_eq!(staked["stake_amount"], 20.0);

        let (_, unstaked) = api
            .post(
                "/providers",
                json!({
                    "name": "Unstaked",
                    "walletAddress": "0x00000000000000000000000000000000000000c4",
                }),
            )
            .await;

        let id = api.create_task(task_body(10.0, "agent")).await;

        let (status, body) = api
            .post(
                &format!("/tasks/{}/match", id),
                json!({ "providerId": unstaked["id"] }),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "PROVIDER_INELIGIBLE");

        let (status, deposit) = api
            .post(
                "/ledger/deposits",
                json!({
                    "fromAddress": "0x00000000000000000000000000000000000000a1",
                    "amount": 10.0,
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", deposit);
        assert_eq!(deposit["amountWei"], (10 * WEI).to_string());

        let (status, task) = api
            .post(
                &format!("/tasks/{}/fund", id),
                json!({ "depositTxHash": deposit["txHash"] }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", task);
        assert!(task["escrow_tx"].is_string());

        let (status, task) = api
            .post(
                &format!("/tasks/{}/match", id),
                json!({ "providerId": staked["id"] }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", task);
        assert_eq!(task["status"], "ESCROWED");
    }

    #[tokio::test]
    async fn deposit_validates_input() {
        let api = setup();

        let (status, body) = api
            .post("/ledger/deposits", json!({ "fromAddress": WALLET }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "amount");

        let (status, body) = api
            .post("/ledger/deposits", json!({ "fromAddress": WALLET, "amount": 0.0 }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "amount");

        let (status, body) = api
            .post(
                "/providers",
                json!({ "name": "Runner", "walletAddress": WALLET, "stakeAmount": -1.0 }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "stakeAmount");
    }

    #[tokio::test]
    async fn route_absent_without_ledger() {
        let blobs = TempDir::new().expect("Failed to create temp dir");
        let mut config = Config::default();
        config.server.blob_dir = blobs.path().to_path_buf();
        let db = Database::open_in_memory().expect("Failed to create in-memory database");
        let chain = ChainBackend::from_config(&config.chain).expect("Failed to build chain backend");
        let app = App::assemble(db, chain, &config);
        let router = build_router(AppState::new(app.lifecycle, app.blobs));

        let response = router
            .oneshot(
                Request::post("/ledger/deposits")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(json!({ "fromAddress": WALLET, "amount": 1.0 }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

mod upload_routes {
    use super::*;

    const BOUNDARY: &str = "settlement-test-boundary";

    fn multipart(parts: &[(&str, Option<&str>, &str)]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, filename, data) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n",
                        name, filename
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                ),
            }
            body.extend_from_slice(data.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::post("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn stored_files_are_served_back() {
        let api = setup();
        let id = api.create_task(task_body(0.0, "human")).await;
        let (status, body) = api
            .send(multipart(&[
                ("taskId", None, id.as_str()),
                ("files", Some("receipt.png"), "not really a png"),
            ]))
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);

        let urls = body["urls"].as_array().unwrap();
        assert_eq!(urls.len(), 1);
        let url = urls[0].as_str().unwrap();
        assert!(url.starts_with(&format!("/blobs/{}/", id)));
        assert!(url.ends_with(".png"));

        let response = api
            .router
            .clone()
            .oneshot(Request::get(url).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"not really a png");
    }

    #[tokio::test]
    async fn task_id_is_required() {
        let api = setup();
        let (status, body) = api
            .send(multipart(&[("files", Some("a.txt"), "hello")]))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "taskId");
    }

    #[tokio::test]
    async fn at_least_one_file_is_required() {
        let api = setup();
        let id = api.create_task(task_body(0.0, "human")).await;
        let (status, _) = api.send(multipart(&[("taskId", None, id.as_str())])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_task_is_rejected_before_storing() {
        let api = setup();
        let (status, body) = api
            .send(multipart(&[
                ("taskId", None, "no-such-task"),
                ("files", Some("receipt.png"), "bytes"),
            ]))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "TASK_NOT_FOUND");
        assert!(!api.blobs.path().join("no-such-task").exists());
    }
}
