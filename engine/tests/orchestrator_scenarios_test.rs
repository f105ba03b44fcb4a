//! End-to-end task scenarios
//!
//! The whole engine is built from a config file pointing at wiremock
//! servers for the model, its control plane and a tool backend.

use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::{
    matchers::{body_string_contains, method, path},
    Mock, MockServer, ResponseTemplate,
};

use orca_engine::config::Config;
use orca_engine::daemon::Orca;
use orca_engine::lifecycle::EndpointState;
use orca_engine::message_bus::{Event, EventType};
use orca_engine::orchestrator::{Priority, TaskStatus};
use sdk::errors::ErrorKind;
use sdk::harmony::{Content, Role};

const WAIT: Duration = Duration::from_secs(10);

struct Servers {
    model: MockServer,
    control: MockServer,
    tools: MockServer,
}

impl Servers {
    async fn start() -> Self {
        let servers = Self {
            model: MockServer::start().await,
            control: MockServer::start().await,
            tools: MockServer::start().await,
        };

        Mock::given(method("POST"))
            .and(path("/wake"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&servers.control)
            .await;
        Mock::given(method("POST"))
            .and(path("/sleep"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&servers.control)
            .await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&servers.control)
            .await;

        Mock::given(method("GET"))
            .and(path("/tools"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tools": [{
                    "name": "search_web",
                    "description": "Search the web",
                    "parameters": {
                        "type": "object",
                        "properties": { "query": { "type": "string" } }
                    }
                }]
            })))
            .mount(&servers.tools)
            .await;

        servers
    }

    fn config(&self, dir: &TempDir, max_iterations: u32) -> Config {
        let contents = format!(
            r#"
[core]
log_level = "debug"

[orchestrator]
max_iterations = {max_iterations}
wake_timeout_secs = 5
wake_poll_interval_ms = 10
shutdown_grace_secs = 1

[retry]
max_retries = 2
initial_backoff_ms = 1
max_backoff_ms = 5
jitter_factor = 0.0

[[endpoints]]
key = "120b"
base_url = "{model}"
control_url = "{control}"
model = "gpt-oss-120b"

[tools]
call_timeout_secs = 5

[[tools.backends]]
id = "web"
base_url = "{tools}"
"#,
            max_iterations = max_iterations,
            model = self.model.uri(),
            control = self.control.uri(),
            tools = self.tools.uri(),
        );

        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        Config::load_from_path(&path).unwrap()
    }
}

fn text_reply(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "message": {
            "role": "assistant",
            "content": [{ "type": "text", "text": text }]
        }
    }))
}

fn search_reply(id: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "message": {
            "role": "assistant",
            "content": [{
                "type": "tool_call",
                "id": id,
                "name": "search_web",
                "arguments": { "query": "rust async runtimes" }
            }]
        }
    }))
}

fn search_result(id: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "success": true,
        "tool_call_id": id,
        "result": { "hits": ["tokio.rs"] }
    }))
}

#[tokio::test]
async fn test_summarize_wakes_endpoint_and_completes() {
    let servers = Servers::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .respond_with(text_reply("A short summary."))
        .expect(1)
        .mount(&servers.model)
        .await;

    let dir = TempDir::new().unwrap();
    let mut orca = Orca::init(servers.config(&dir, 20)).await.unwrap();
    let mut endpoint_events = orca.bus().subscribe(EventType::EndpointStateChanged).await;
    assert_eq!(
        orca.lifecycle().status("120b").unwrap().state,
        EndpointState::Stopped
    );

    let orchestrator = orca.orchestrator().clone();
    let id = orchestrator
        .create_task("Summarize", "Summarize this", "120b", Priority::Normal)
        .await
        .unwrap();
    assert_eq!(
        orchestrator.get_task_status(&id).unwrap().status,
        TaskStatus::Created
    );

    orchestrator.start_task(&id).await.unwrap();
    let task = orchestrator.wait_for_task(&id, WAIT).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.as_deref(), Some("A short summary."));
    assert_eq!(task.iterations, 1);
    assert_eq!(task.conversation.len(), 2);
    assert_eq!(task.conversation[1].role, Role::Assistant);
    assert!(task.started_at.is_some() && task.finished_at.is_some());

    match endpoint_events.recv().await.unwrap() {
        Event::EndpointStateChanged { key, from, to } => {
            assert_eq!(key, "120b");
            assert_eq!(from, EndpointState::Stopped);
            assert_eq!(to, EndpointState::Starting);
        }
        other => panic!("Unexpected event {:?}", other),
    }
    assert_eq!(
        orca.lifecycle().status("120b").unwrap().state,
        EndpointState::Running
    );

    orca.shutdown().await;
}

#[tokio::test]
async fn test_tool_call_then_answer() {
    let servers = Servers::start().await;
    // Second generation sees the tool result and answers
    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .and(body_string_contains("\"tool_result\""))
        .respond_with(text_reply("tokio is the most used runtime."))
        .expect(1)
        .mount(&servers.model)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .respond_with(search_reply("tc1"))
        .expect(1)
        .mount(&servers.model)
        .await;
    Mock::given(method("POST"))
        .and(path("/call"))
        .respond_with(search_result("tc1"))
        .expect(1)
        .mount(&servers.tools)
        .await;

    let dir = TempDir::new().unwrap();
    let mut orca = Orca::init(servers.config(&dir, 20)).await.unwrap();
    assert_eq!(orca.tools().catalog_size(), 1);
    let mut tool_events = orca.bus().subscribe(EventType::ToolExecuted).await;

    let orchestrator = orca.orchestrator().clone();
    let id = orchestrator
        .create_task("Research", "Which async runtime should I use?", "120b", Priority::High)
        .await
        .unwrap();
    orchestrator.start_task(&id).await.unwrap();
    let task = orchestrator.wait_for_task(&id, WAIT).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.iterations, 2);
    assert_eq!(task.result.as_deref(), Some("tokio is the most used runtime."));

    // user, assistant(tool_call), tool(tool_result), assistant(text)
    assert_eq!(task.conversation.len(), 4);
    let tool_message = &task.conversation[2];
    assert_eq!(tool_message.role, Role::Tool);
    match &tool_message.content[0] {
        Content::ToolResult(result) => {
            assert_eq!(result.tool_call_id, "tc1");
            assert_eq!(result.result.as_ref().unwrap()["hits"][0], "tokio.rs");
            assert!(result.error.is_none());
        }
        other => panic!("Expected tool_result, got {:?}", other),
    }

    match tool_events.recv().await.unwrap() {
        Event::ToolExecuted {
            task_id,
            tool,
            tool_call_id,
            success,
        } => {
            assert_eq!(task_id, id);
            assert_eq!(tool, "search_web");
            assert_eq!(tool_call_id, "tc1");
            assert!(success);
        }
        other => panic!("Unexpected event {:?}", other),
    }

    orca.shutdown().await;
}

#[tokio::test]
async fn test_endless_tool_calls_hit_iteration_limit() {
    let servers = Servers::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .respond_with(search_reply("tc-loop"))
        .mount(&servers.model)
        .await;
    Mock::given(method("POST"))
        .and(path("/call"))
        .respond_with(search_result("tc-loop"))
        .mount(&servers.tools)
        .await;

    let dir = TempDir::new().unwrap();
    let mut orca = Orca::init(servers.config(&dir, 3)).await.unwrap();
    let orchestrator = orca.orchestrator().clone();

    let id = orchestrator
        .create_task("Loop", "Never stop searching", "120b", Priority::Low)
        .await
        .unwrap();
    orchestrator.start_task(&id).await.unwrap();
    let task = orchestrator.wait_for_task(&id, WAIT).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.iterations, 3);
    assert!(task.result.is_none());
    assert_eq!(task.error.unwrap().kind, ErrorKind::IterationLimitExceeded);

    orca.shutdown().await;
}

#[tokio::test]
async fn test_stop_before_first_generation() {
    let servers = Servers::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .respond_with(text_reply("should never be requested"))
        .expect(0)
        .mount(&servers.model)
        .await;

    let dir = TempDir::new().unwrap();
    let mut orca = Orca::init(servers.config(&dir, 20)).await.unwrap();
    let orchestrator = orca.orchestrator().clone();

    let id = orchestrator
        .create_task("Summarize", "Summarize this", "120b", Priority::Normal)
        .await
        .unwrap();
    orchestrator.stop_task(&id).unwrap();
    orchestrator.start_task(&id).await.unwrap();
    let task = orchestrator.wait_for_task(&id, WAIT).await.unwrap();

    assert_eq!(task.status, TaskStatus::Stopped);
    assert!(task.result.is_none());
    assert!(task.error.is_none());
    assert_eq!(task.conversation.len(), 1);
    assert_eq!(task.conversation[0].text(), "Summarize this");

    orca.shutdown().await;
}

#[tokio::test]
async fn test_stop_during_tool_execution() {
    let servers = Servers::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .respond_with(search_reply("tc1"))
        .expect(1)
        .mount(&servers.model)
        .await;
    Mock::given(method("POST"))
        .and(path("/call"))
        .respond_with(search_result("tc1").set_delay(Duration::from_millis(500)))
        .expect(1)
        .mount(&servers.tools)
        .await;

    let dir = TempDir::new().unwrap();
    let mut orca = Orca::init(servers.config(&dir, 20)).await.unwrap();
    let orchestrator = orca.orchestrator().clone();

    let id = orchestrator
        .create_task("Research", "Search something", "120b", Priority::Normal)
        .await
        .unwrap();
    orchestrator.start_task(&id).await.unwrap();

    // Wait until the tool server has the call, then stop
    let mut tool_called = false;
    for _ in 0..200 {
        let requests = servers.tools.received_requests().await.unwrap_or_default();
        if requests.iter().any(|r| r.url.path() == "/call") {
            tool_called = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(tool_called, "tool was never called");
    orchestrator.stop_task(&id).unwrap();

    let task = orchestrator.wait_for_task(&id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Stopped);
    assert_eq!(task.iterations, 1);
    // The in-flight call finished and its result was recorded
    assert_eq!(task.conversation.len(), 3);
    assert_eq!(task.conversation[2].role, Role::Tool);
    assert!(task.result.is_none());

    orca.shutdown().await;
}

#[tokio::test]
async fn test_unknown_tool_is_reported_to_the_model() {
    let servers = Servers::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .and(body_string_contains("not_found"))
        .respond_with(text_reply("That tool does not exist."))
        .mount(&servers.model)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {
                "role": "assistant",
                "content": [{
                    "type": "tool_call",
                    "id": "tc7",
                    "name": "launch_rocket",
                    "arguments": {}
                }]
            }
        })))
        .mount(&servers.model)
        .await;

    let dir = TempDir::new().unwrap();
    let mut orca = Orca::init(servers.config(&dir, 20)).await.unwrap();
    let orchestrator = orca.orchestrator().clone();

    let id = orchestrator
        .create_task("Launch", "Launch the rocket", "120b", Priority::Critical)
        .await
        .unwrap();
    orchestrator.start_task(&id).await.unwrap();
    let task = orchestrator.wait_for_task(&id, WAIT).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.iterations, 2);
    match &task.conversation[2].content[0] {
        Content::ToolResult(result) => {
            assert_eq!(result.tool_call_id, "tc7");
            assert!(result.result.is_none());
            assert!(result.error.is_some());
        }
        other => panic!("Expected tool_result, got {:?}", other),
    }

    orca.shutdown().await;
}

#[tokio::test]
async fn test_model_rejection_fails_task_with_cause() {
    let servers = Servers::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .respond_with(ResponseTemplate::new(400).set_body_string("context window exceeded"))
        .mount(&servers.model)
        .await;

    let dir = TempDir::new().unwrap();
    let mut orca = Orca::init(servers.config(&dir, 20)).await.unwrap();
    let orchestrator = orca.orchestrator().clone();

    let id = orchestrator
        .create_task("Summarize", "Summarize this", "120b", Priority::Normal)
        .await
        .unwrap();
    orchestrator.start_task(&id).await.unwrap();
    let task = orchestrator.wait_for_task(&id, WAIT).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.iterations, 0);
    let error = task.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Upstream);
    assert!(error.message.contains("context window exceeded"));

    let stats = orchestrator.get_system_stats();
    assert_eq!(stats.tasks.failed, 1);
    assert_eq!(stats.tool_catalog_size, 1);

    orca.shutdown().await;
}

#[tokio::test]
async fn test_tasks_listed_in_creation_order() {
    let servers = Servers::start().await;

    let dir = TempDir::new().unwrap();
    let mut orca = Orca::init(servers.config(&dir, 20)).await.unwrap();
    let orchestrator = orca.orchestrator().clone();

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            orchestrator
                .create_task(&format!("Task {}", i), "Do it", "120b", Priority::Normal)
                .await
                .unwrap(),
        );
    }

    let listed: Vec<String> = orchestrator
        .list_tasks(Some(TaskStatus::Created))
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(listed, ids);
    assert!(orchestrator.list_tasks(Some(TaskStatus::Running)).is_empty());

    orca.shutdown().await;
}
