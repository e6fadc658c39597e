//! Workspace acceptance tests: gate → bus → AI turn → sandbox.
//!
//! Tests cover:
//! - Express app flow: prompt, directive broadcast, mount, run, preview
//! - Refused joins (expired, revoked, missing credentials) leave no membership
//! - Malformed model output becomes an ai-error; the channel stays usable
//! - Human tree edits replace the tree wholesale and reach every member
//! - Last participant leaving tears the sandbox down

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devroom_agent::{GenerationRequest, GenerativeModel, UpstreamError};
use devroom_sandbox::testing::ScriptedFactory;
use devroom_sandbox::SandboxState;
use devroom_sdk::{CommandSpec, Directive, FileTree, SandboxStatus, ServerEvent};
use devroom_server::bus::{ChannelJoinError, Membership};
use devroom_server::config::ServerConfig;
use devroom_server::coordinator::Coordinator;
use devroom_server::gate::{AuthFailure, CredentialSource, Identity};
use devroom_server::server::Server;
use tokio::time::timeout;

const TIMEOUT_MS: u64 = 2000;
const HOUR: Duration = Duration::from_secs(3600);

/// Model that replays canned answers in order.
struct CannedModel {
    answers: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl CannedModel {
    fn new(answers: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl GenerativeModel for CannedModel {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, UpstreamError> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(UpstreamError::EmptyResponse)
    }
}

struct Harness {
    coordinator: Arc<Coordinator>,
    runtimes: Arc<ScriptedFactory>,
    model: Arc<CannedModel>,
}

fn harness(answers: &[&str]) -> Harness {
    let model = CannedModel::new(answers);
    let runtimes = ScriptedFactory::new();
    let config = ServerConfig {
        jwt_secret: "acceptance-secret".to_string(),
        ..Default::default()
    };
    let server = Server::with_components(config, model.clone(), runtimes.clone()).unwrap();
    let coordinator = server.coordinator();
    coordinator.spawn_sandbox_republisher();
    Harness {
        coordinator,
        runtimes,
        model,
    }
}

impl Harness {
    fn token(&self, subject: &str) -> String {
        self.coordinator
            .gate()
            .issue(subject, Some(&format!("{subject}@example.com")), HOUR)
    }

    async fn join(&self, project: &str, subject: &str) -> Membership {
        let header = format!("Bearer {}", self.token(subject));
        self.coordinator
            .connect(project, CredentialSource::from_authorization(&header))
            .await
            .unwrap()
    }
}

async fn next_matching(
    membership: &mut Membership,
    predicate: impl Fn(&ServerEvent) -> bool,
    desc: &str,
) -> ServerEvent {
    let deadline = Duration::from_millis(TIMEOUT_MS);
    let start = tokio::time::Instant::now();
    loop {
        match timeout(deadline.saturating_sub(start.elapsed()), membership.events.recv()).await {
            Ok(Some(event)) if predicate(&event) => return event.as_ref().clone(),
            Ok(Some(_)) => continue,
            _ => panic!("Timeout waiting for: {desc}"),
        }
    }
}

fn is_ai_message(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::ProjectMessage(m) if m.sender.is_ai())
}

fn express_directive() -> String {
    serde_json::json!({
        "text": "Here is an Express server.",
        "fileTree": {
            "app.js": { "file": { "contents": "const express = require('express');\nconst app = express();\napp.get('/', (req, res) => res.send('Hello'));\napp.listen(process.env.PORT || 3000);\n" } },
            "package.json": { "file": { "contents": "{\"name\":\"express-app\",\"dependencies\":{\"express\":\"^4.21.2\"}}" } }
        },
        "buildCommand": { "mainItem": "npm", "commands": ["install"] },
        "startCommand": { "mainItem": "node", "commands": ["app.js"] }
    })
    .to_string()
}

#[tokio::test]
async fn express_app_flow_reaches_preview() {
    let h = harness(&[&express_directive()]);
    let mut alice = h.join("p1", "alice").await;
    let mut bob = h.join("p1", "bob").await;
    let identity = alice.identity.clone();

    let receipt = h
        .coordinator
        .send("p1", &identity, "Create an express app".to_string());
    let echoed = receipt.message.unwrap();
    assert_eq!(echoed.sender.id, "alice");
    receipt.ai_turn.unwrap().await.unwrap();
    assert_eq!(h.model.prompts.lock().unwrap().as_slice(), ["Create an express app"]);

    // Both members see the echo and then the AI directive.
    for member in [&mut alice, &mut bob] {
        let ServerEvent::ProjectMessage(first) =
            next_matching(member, |e| matches!(e, ServerEvent::ProjectMessage(_)), "echo").await
        else {
            unreachable!()
        };
        assert_eq!(first.message, "Create an express app");
        let ServerEvent::ProjectMessage(reply) = next_matching(member, is_ai_message, "AI reply").await
        else {
            unreachable!()
        };
        assert!(reply.seq > first.seq);
        let directive = Directive::from_payload(&reply.message).unwrap();
        assert_eq!(directive.file_tree.as_ref().unwrap().paths(), vec!["app.js", "package.json"]);
    }

    // The tree is mounted but nothing runs until asked.
    assert_eq!(h.coordinator.sandboxes().state("p1").await, SandboxState::Mounted);
    let runtime = h.runtimes.runtime("p1").unwrap();
    assert_eq!(runtime.mounted().unwrap().file_count(), 2);
    assert!(runtime.spawned().is_empty());

    // Run with the directive's commands.
    let outcome = h.coordinator.run("p1", None, None).await.unwrap();
    assert_eq!(runtime.spawned(), vec!["npm install", "node app.js"]);
    assert_eq!(h.coordinator.sandboxes().state("p1").await, SandboxState::Running);

    runtime.announce_ready(outcome.process, 3000);
    let ServerEvent::SandboxStatus(SandboxStatus::PreviewReady { port, url }) = next_matching(
        &mut alice,
        |e| matches!(e, ServerEvent::SandboxStatus(SandboxStatus::PreviewReady { .. })),
        "preview",
    )
    .await
    else {
        unreachable!()
    };
    assert_eq!(port, 3000);
    assert!(url.ends_with(":3000"));
    assert_eq!(h.coordinator.sandboxes().state("p1").await, SandboxState::Ready);
}

#[tokio::test]
async fn expired_token_join_is_refused_without_membership() {
    let h = harness(&[]);
    let now = chrono::Utc::now().timestamp();
    let token = h.coordinator.gate().sign(&Identity {
        sub: "late".to_string(),
        email: None,
        iat: now - 7200,
        exp: now - 3600,
    });

    let err = h
        .coordinator
        .connect("p1", CredentialSource { cookie: Some(&token), authorization: None })
        .await
        .err()
        .unwrap();
    let ChannelJoinError::Unauthenticated(unauthorized) = err else {
        panic!("expected an authentication failure");
    };
    assert_eq!(unauthorized.reason, AuthFailure::Expired);
    assert_eq!(h.coordinator.bus().channel_count(), 0);
    assert!(h.coordinator.bus().participants("p1").is_empty());
}

#[tokio::test]
async fn missing_credentials_are_refused() {
    let h = harness(&[]);
    let err = h
        .coordinator
        .connect("p1", CredentialSource::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        ChannelJoinError::Unauthenticated(ref u) if u.reason == AuthFailure::Missing
    ));
}

#[tokio::test]
async fn revoked_token_cannot_rejoin() {
    let h = harness(&[]);
    let token = h.token("alice");
    let header = format!("Bearer {token}");
    h.coordinator
        .connect("p1", CredentialSource::from_authorization(&header))
        .await
        .unwrap();

    h.coordinator
        .logout(CredentialSource::from_authorization(&header))
        .await
        .unwrap();

    let err = h
        .coordinator
        .connect("p1", CredentialSource::from_authorization(&header))
        .await
        .err()
        .unwrap();
    let ChannelJoinError::Unauthenticated(unauthorized) = err else {
        panic!("expected an authentication failure");
    };
    assert_eq!(unauthorized.reason, AuthFailure::Revoked);
    assert!(unauthorized.clear_cookie);
}

#[tokio::test]
async fn malformed_model_output_is_an_ai_error() {
    let h = harness(&["Sure! Here's your app: {", r#"{"text":"Hello! How can I help?"}"#]);
    let mut alice = h.join("p1", "alice").await;
    let identity = alice.identity.clone();

    let receipt = h.coordinator.send("p1", &identity, "make an app".to_string());
    let reply_to = receipt.message.unwrap().id;
    receipt.ai_turn.unwrap().await.unwrap();

    let ServerEvent::AiError { reply_to: failed, error } = next_matching(
        &mut alice,
        |e| matches!(e, ServerEvent::AiError { .. }),
        "ai-error",
    )
    .await
    else {
        unreachable!()
    };
    assert_eq!(failed, reply_to);
    assert!(error.contains("not valid JSON"), "{error}");
    assert!(h.coordinator.bus().is_member("p1", alice.connection));
    assert_eq!(h.coordinator.sandboxes().state("p1").await, SandboxState::Idle);

    // The channel keeps working for the next turn.
    let receipt = h.coordinator.send("p1", &identity, "Hello".to_string());
    receipt.ai_turn.unwrap().await.unwrap();
    let ServerEvent::ProjectMessage(reply) = next_matching(&mut alice, is_ai_message, "AI reply").await
    else {
        unreachable!()
    };
    assert_eq!(Directive::from_payload(&reply.message).unwrap(), Directive::text("Hello! How can I help?"));
}

#[tokio::test]
async fn human_tree_edit_replaces_and_broadcasts() {
    let h = harness(&[]);
    let alice = h.join("p1", "alice").await;
    let mut bob = h.join("p1", "bob").await;

    let first = FileTree::new().with_file("index.js", "console.log(1)");
    let second = FileTree::new().with_file("server.js", "console.log(2)");
    h.coordinator
        .update_tree("p1", &alice.identity, first)
        .await
        .unwrap();
    h.coordinator
        .update_tree("p1", &alice.identity, second.clone())
        .await
        .unwrap();

    assert_eq!(h.coordinator.tree("p1").await.unwrap(), Some(second.clone()));
    assert_eq!(h.runtimes.runtime("p1").unwrap().mounted(), Some(second.clone()));

    let ServerEvent::FileTree { file_tree, updated_by } = next_matching(
        &mut bob,
        |e| matches!(e, ServerEvent::FileTree { file_tree, .. } if file_tree.get("server.js").is_some()),
        "second tree",
    )
    .await
    else {
        unreachable!()
    };
    assert_eq!(file_tree, second);
    assert_eq!(updated_by.id, "alice");
}

#[tokio::test]
async fn invalid_tree_edit_is_rejected() {
    let h = harness(&[]);
    let alice = h.join("p1", "alice").await;
    let tree = FileTree::new().with_file("../escape.js", "");
    assert!(h.coordinator.update_tree("p1", &alice.identity, tree).await.is_err());
    assert_eq!(h.coordinator.tree("p1").await.unwrap(), None);
}

#[tokio::test]
async fn spawn_failure_is_reported_and_sandbox_stays_mounted() {
    let h = harness(&[]);
    let mut alice = h.join("p1", "alice").await;
    let tree = FileTree::new().with_file("index.js", "");
    h.coordinator
        .update_tree("p1", &alice.identity, tree.clone())
        .await
        .unwrap();

    let missing = CommandSpec::new("missing", Vec::<String>::new());
    assert!(h.coordinator.run("p1", None, Some(missing)).await.is_err());
    next_matching(
        &mut alice,
        |e| matches!(e, ServerEvent::SandboxStatus(SandboxStatus::RunFailed { .. })),
        "run-failed",
    )
    .await;
    assert_eq!(h.coordinator.sandboxes().state("p1").await, SandboxState::Mounted);
    assert_eq!(h.runtimes.runtime("p1").unwrap().mounted(), Some(tree));
}

#[tokio::test]
async fn last_leave_tears_sandbox_down() {
    let h = harness(&[]);
    let alice = h.join("p1", "alice").await;
    let bob = h.join("p1", "bob").await;
    h.coordinator
        .update_tree("p1", &alice.identity, FileTree::new().with_file("a.js", ""))
        .await
        .unwrap();

    h.coordinator.disconnect("p1", alice.connection).await;
    assert_eq!(h.coordinator.sandboxes().state("p1").await, SandboxState::Mounted);

    h.coordinator.disconnect("p1", bob.connection).await;
    assert_eq!(h.coordinator.sandboxes().state("p1").await, SandboxState::Idle);
    assert!(h.runtimes.runtime("p1").unwrap().torn_down());

    // The stored tree survives; a later run remounts it.
    let carol = h.join("p1", "carol").await;
    h.coordinator
        .run("p1", None, Some(CommandSpec::new("node", ["a.js"])))
        .await
        .unwrap();
    assert_eq!(h.coordinator.sandboxes().state("p1").await, SandboxState::Running);
    h.coordinator.disconnect("p1", carol.connection).await;
}
