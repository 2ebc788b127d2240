//! End-to-end engine behaviour against the scripted runtime

use sandpit_core::profile::SOURCE_ENV;
use sandpit_core::runtime::{MockProgram, MockRuntime};
use sandpit_core::{
    EngineConfig, EngineError, ExecutionEngine, ExecutionRequest, Language, SandboxRegistry,
    SecurityScreen,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn engine_with(runtime: MockRuntime) -> (Arc<MockRuntime>, ExecutionEngine) {
    let runtime = Arc::new(runtime);
    let engine = ExecutionEngine::new(runtime.clone(), EngineConfig::default()).unwrap();
    (runtime, engine)
}

#[tokio::test]
async fn no_sandbox_outlives_a_call() {
    let (runtime, engine) = engine_with(MockRuntime::new(|spec| {
        match spec.env_var(SOURCE_ENV) {
            Some("ok") => MockProgram::exits(0).stdout("fine"),
            Some("crash") => MockProgram::exits(1).stderr("Traceback: ValueError: boom"),
            Some("attach") => MockProgram::exits(0).failing_attach("attach refused"),
            _ => MockProgram::hangs(),
        }
    }));

    for code in ["ok", "crash", "attach", "spin"] {
        let before = engine.active_sandbox_count();
        let request = ExecutionRequest::new(Language::Python, code).with_timeout_ms(50);
        let _ = engine.execute_code(&request).await;
        assert_eq!(engine.active_sandbox_count(), before, "leak after {code:?}");
    }
    assert_eq!(runtime.created(), 4);
    assert_eq!(runtime.live(), 0);
}

#[tokio::test]
async fn dangerous_code_is_rejected_before_provisioning() {
    let (runtime, engine) = engine_with(MockRuntime::always(MockProgram::exits(0)));

    let cases = [
        (Language::Python, "import os\nos.system('ls')"),
        (Language::JavaScript, "require('child_process').execSync('id')"),
        (Language::Java, "Runtime.getRuntime().exec(\"id\");"),
        (Language::Go, "import \"os/exec\""),
        (Language::Rust, "use std::process::Command;"),
        (Language::TypeScript, "Deno.run({ cmd: ['id'] })"),
        (Language::Python, "print('sudo make me a sandwich')"),
    ];
    for (language, code) in cases {
        let err = engine
            .execute_code(&ExecutionRequest::new(language, code))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Security { .. }), "{language}: {code}");
    }
    assert_eq!(runtime.created(), 0);
}

#[tokio::test]
async fn empty_and_oversized_code_are_security_errors() {
    let (runtime, engine) = engine_with(MockRuntime::always(MockProgram::exits(0)));

    let too_big = "x".repeat(50_001);
    for code in ["", "   \n\t", too_big.as_str()] {
        let err = engine
            .execute_code(&ExecutionRequest::new(Language::JavaScript, code))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Security { .. }));
    }

    let exactly_limit = "1".repeat(50_000);
    engine
        .execute_code(&ExecutionRequest::new(Language::JavaScript, exactly_limit))
        .await
        .unwrap();
    assert_eq!(runtime.created(), 1);
}

#[tokio::test]
async fn oversized_input_lists_every_violation() {
    let (_runtime, engine) = engine_with(MockRuntime::always(MockProgram::exits(0)));
    let request = ExecutionRequest::new(Language::Python, "").with_input("y".repeat(10_001));

    let EngineError::Security { violations } = engine.execute_code(&request).await.unwrap_err()
    else {
        panic!("expected a security error");
    };
    assert_eq!(violations.len(), 2);
}

#[tokio::test]
async fn infinite_loop_times_out_promptly() {
    let (runtime, engine) = engine_with(MockRuntime::always(MockProgram::hangs()));
    let request = ExecutionRequest::new(Language::Python, "while True: pass").with_timeout_ms(200);

    let started = Instant::now();
    let result = engine.execute_code(&request).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(result.timed_out);
    assert!(!result.success);
    assert_eq!(result.exit_code, 124);
    assert!(result.error.unwrap().contains("timed out after 200ms"));
    assert_eq!(runtime.kills(), 1);
    assert_eq!(engine.active_sandbox_count(), 0);
}

#[tokio::test]
async fn program_finishing_first_is_not_a_timeout() {
    let (runtime, engine) = engine_with(MockRuntime::always(
        MockProgram::exits(0)
            .stdout("done")
            .running_for(Duration::from_millis(20)),
    ));
    let request = ExecutionRequest::new(Language::Go, "package main").with_timeout_ms(5_000);

    let result = engine.execute_code(&request).await.unwrap();
    assert!(!result.timed_out);
    assert_eq!(result.output, "done");
    assert_eq!(runtime.kills(), 0);
}

#[tokio::test]
async fn runtime_error_is_a_normal_result() {
    let (_runtime, engine) = engine_with(MockRuntime::always(
        MockProgram::exits(1).stderr("Error: boom\n    at main.js:1:7\n"),
    ));
    let request = ExecutionRequest::new(Language::JavaScript, "throw new Error('boom')");

    let result = engine.execute_code(&request).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.exit_code, 1);
    assert!(result.error.unwrap().contains("boom"));
}

#[tokio::test]
async fn provisioning_failure_leaves_registry_clean() {
    let (_runtime, engine) = engine_with(
        MockRuntime::always(MockProgram::exits(0)).with_create_failure("docker daemon not running"),
    );

    let err = engine
        .execute_code(&ExecutionRequest::new(Language::Rust, "fn main() {}"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ResourceLimit { .. }));
    assert_eq!(engine.active_sandbox_count(), 0);
}

#[tokio::test]
async fn runtime_failure_mid_run_still_reaps() {
    let (runtime, engine) = engine_with(MockRuntime::always(
        MockProgram::exits(0).failing_start("cgroup setup failed"),
    ));

    let err = engine
        .execute_code(&ExecutionRequest::new(Language::Java, "class Main {}"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExecutionTimeout { .. }));
    assert_eq!(engine.active_sandbox_count(), 0);
    assert_eq!(runtime.removed(), 1);
}

#[tokio::test]
async fn invalid_memory_limit_is_a_resource_error() {
    let (runtime, engine) = engine_with(MockRuntime::always(MockProgram::exits(0)));
    let request = ExecutionRequest::new(Language::Python, "print(1)").with_memory_limit("huge");

    let err = engine.execute_code(&request).await.unwrap_err();
    assert!(matches!(err, EngineError::ResourceLimit { .. }));
    assert_eq!(runtime.created(), 0);
}

#[tokio::test]
async fn output_is_demultiplexed_and_trimmed() {
    let (_runtime, engine) = engine_with(MockRuntime::always(
        MockProgram::exits(0)
            .stdout("\n  first\n")
            .stderr("warning: unused\n")
            .stdout("second  \n"),
    ));

    let result = engine
        .execute_code(&ExecutionRequest::new(Language::Rust, "fn main() {}"))
        .await
        .unwrap();
    assert_eq!(result.output, "first\nsecond");
    assert_eq!(result.error.as_deref(), Some("warning: unused"));
}

#[tokio::test]
async fn concurrent_executions_get_separate_sandboxes() {
    let (runtime, engine) = engine_with(MockRuntime::always(
        MockProgram::exits(0).running_for(Duration::from_millis(20)),
    ));
    let engine = Arc::new(engine);

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let request = ExecutionRequest::new(Language::Python, format!("print({i})"));
                engine.execute_code(&request).await
            })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().unwrap().success);
    }

    let names: std::collections::HashSet<_> =
        runtime.specs().into_iter().map(|spec| spec.name).collect();
    assert_eq!(names.len(), 16);
    assert_eq!(runtime.live(), 0);
    assert_eq!(engine.active_sandbox_count(), 0);
}

#[tokio::test]
async fn cancelled_execution_is_reaped() {
    let (runtime, engine) = engine_with(MockRuntime::always(MockProgram::hangs()));
    let engine = Arc::new(engine);

    let task = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let request = ExecutionRequest::new(Language::Python, "while True: pass");
            engine.execute_code(&request).await
        })
    };
    while engine.active_sandbox_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    task.abort();
    let _ = task.await;

    for _ in 0..100 {
        if runtime.live() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(runtime.live(), 0);
    assert_eq!(engine.active_sandbox_count(), 0);
}

#[tokio::test]
async fn cleanup_all_reaps_everything_live() {
    let runtime = Arc::new(MockRuntime::always(MockProgram::hangs()));
    let registry = Arc::new(SandboxRegistry::new());
    let engine = Arc::new(ExecutionEngine::with_parts(
        runtime.clone(),
        EngineConfig::default(),
        SecurityScreen::standard().unwrap(),
        Arc::clone(&registry),
    ));

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let request = ExecutionRequest::new(Language::Go, "package main")
                    .with_timeout_ms(60_000);
                engine.execute_code(&request).await
            })
        })
        .collect();
    while registry.count() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(engine.cleanup_all_sandboxes().await, 3);
    assert_eq!(registry.count(), 0);
    assert_eq!(runtime.live(), 0);

    // each run sees its container vanish underneath it
    for task in tasks {
        let _ = task.await.unwrap();
    }
    assert_eq!(runtime.removed(), 3);
}

#[tokio::test]
async fn stdin_reaches_the_program() {
    let (runtime, engine) = engine_with(MockRuntime::always(MockProgram::exits(0)));
    let request = ExecutionRequest::new(Language::Python, "print(input())").with_input("hello");

    engine.execute_code(&request).await.unwrap();
    assert_eq!(runtime.delivered_stdin(), vec![b"hello".to_vec()]);
    assert!(runtime.specs()[0].open_stdin);
}

#[tokio::test]
async fn cleanup_waits_for_reaps_of_aborted_executions() {
    let (runtime, engine) = engine_with(
        MockRuntime::always(MockProgram::hangs()).with_stop_delay(Duration::from_millis(300)),
    );
    let engine = Arc::new(engine);

    let task = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let request = ExecutionRequest::new(Language::Python, "while True: pass");
            engine.execute_code(&request).await
        })
    };
    while engine.active_sandbox_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // as the daemon does when it shuts down with a connection in flight
    task.abort();
    let _ = task.await;
    tokio::task::yield_now().await;

    engine.cleanup_all_sandboxes().await;
    assert_eq!(runtime.live(), 0);
    assert_eq!(engine.active_sandbox_count(), 0);
}

#[tokio::test]
async fn cleanup_retries_a_failed_teardown() {
    let (runtime, engine) = engine_with(
        MockRuntime::always(MockProgram::exits(0).stdout("ok")).with_remove_failure("device busy"),
    );

    let result = engine
        .execute_code(&ExecutionRequest::new(Language::Python, "print('ok')"))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(engine.active_sandbox_count(), 0);
    assert_eq!(runtime.live(), 1);

    runtime.clear_remove_failure();
    assert_eq!(engine.cleanup_all_sandboxes().await, 1);
    assert_eq!(runtime.live(), 0);
}
