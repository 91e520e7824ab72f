//! 任务生命周期集成测试：状态机、执行器与会话、上下文池协同

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use manus_bridge::browser::{StubBehavior, StubDriverFactory};
    use manus_bridge::config::AppConfig;
    use manus_bridge::core::{BridgeBuilder, BridgeComponents, BridgeError, ErrorKind};
    use manus_bridge::session::{
        FileSessionStore, MemorySessionStore, Session, SessionSource, SessionState, SessionStore,
        StorageState,
    };
    use manus_bridge::task::{TaskInput, TaskResult, TaskStatus, Transition};
    use serde_json::json;

    fn components(factory: Arc<StubDriverFactory>, store: Arc<dyn SessionStore>, max_contexts: usize) -> BridgeComponents {
        let mut config = AppConfig::default();
        config.tasks.min_timeout_secs = 1;
        config.session.allow_env_injection = false;
        config.browser.max_contexts = max_contexts;
        config.browser.launch_retry_delay_ms = 10;
        BridgeBuilder::new(config)
            .with_driver_factory(factory)
            .with_session_store(store)
            .build()
    }

    fn signed_in() -> Session {
        Session::new(
            StorageState {
                cookies: vec![json!({"name": "session_token", "value": "abc", "domain": ".manus.im"})],
                origins: vec![],
            },
            SessionSource::InteractiveLogin,
            chrono::Duration::days(30),
        )
    }

    #[tokio::test]
    async fn test_status_only_moves_forward() {
        let factory = Arc::new(StubDriverFactory::new(StubBehavior::echo()));
        let c = components(factory, Arc::new(MemorySessionStore::new()), 1);

        let id = c.registry.create(TaskInput::new("hello")).await.unwrap();
        let before = c.registry.get(&id).await.unwrap();
        assert_eq!(before.status, TaskStatus::Pending);
        // get 不改变任何东西
        assert_eq!(c.registry.get(&id).await.unwrap(), before);

        let done = c.executor.run(&id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.result.is_some() && done.error.is_none());
        assert!(done.started_at.unwrap() <= done.finished_at.unwrap());

        for transition in [
            Transition::Start,
            Transition::Complete(TaskResult::default()),
        ] {
            let err = c.registry.update(&id, transition).await.unwrap_err();
            assert!(matches!(err, BridgeError::InvalidTransition { .. }));
        }
        assert_eq!(c.registry.get(&id).await.unwrap(), done);

        // 再次执行已结束的任务不会重跑
        assert_eq!(c.executor.run(&id).await.unwrap(), done);
    }

    #[tokio::test]
    async fn test_ping_pong_end_to_end() {
        let factory = Arc::new(StubDriverFactory::new(StubBehavior::reply(
            "pong",
            Duration::from_millis(50),
        )));
        let store = Arc::new(MemorySessionStore::with_session(signed_in()));
        let c = components(Arc::clone(&factory), store, 1);

        let id = c.registry.create(TaskInput::new("ping")).await.unwrap();
        c.executor.spawn(id.clone()).await.unwrap().unwrap();

        let task = c.registry.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let result = task.result.as_ref().unwrap();
        assert_eq!(result.ai_response.as_deref(), Some("pong"));
        assert!(task.execution_time_seconds().unwrap() >= 0.05);
        assert_eq!(factory.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_silent_platform_times_out() {
        let factory = Arc::new(StubDriverFactory::new(StubBehavior::Silent));
        let c = components(factory, Arc::new(MemorySessionStore::new()), 1);

        let id = c
            .registry
            .create(TaskInput::new("anyone there?").with_timeout(1))
            .await
            .unwrap();
        let started = Instant::now();
        let task = c.executor.run(&id).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.unwrap().kind, ErrorKind::Timeout);
        assert!(task.result.is_none());

        // 超时后的上下文被丢弃，下一个任务重新启动
        assert_eq!(c.pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_file_session_fails_without_driver() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session_state.json");
        let validity = chrono::Duration::days(30);
        let file_store = FileSessionStore::new(&path, validity);
        let mut session = signed_in();
        session.created_at = chrono::Utc::now() - chrono::Duration::days(31);
        session.expires_at = chrono::Utc::now() - chrono::Duration::days(1);
        file_store.save(&session).await.unwrap();

        let factory = Arc::new(StubDriverFactory::new(StubBehavior::echo()));
        let c = components(Arc::clone(&factory), Arc::new(file_store), 1);

        let id = c.registry.create(TaskInput::new("hi")).await.unwrap();
        let task = c.executor.run(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.unwrap().kind, ErrorKind::Authentication);
        assert_eq!(factory.launch_count(), 0);
        assert!(factory.submitted().is_empty());

        assert!(!path.exists());
        assert_eq!(c.sessions.status().await.state, SessionState::Expired);
    }

    #[tokio::test]
    async fn test_single_context_runs_sequentially() {
        let factory = Arc::new(StubDriverFactory::new(StubBehavior::reply(
            "ok",
            Duration::from_millis(100),
        )));
        let c = components(Arc::clone(&factory), Arc::new(MemorySessionStore::new()), 1);

        let first = c.registry.create(TaskInput::new("one")).await.unwrap();
        let second = c.registry.create(TaskInput::new("two")).await.unwrap();
        let a = c.executor.spawn(first.clone());
        let b = c.executor.spawn(second.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let counts = c.registry.counts().await;
        assert_eq!(counts.running, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(c.executor.running_count(), 2);

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        let one = c.registry.get(&first).await.unwrap();
        let two = c.registry.get(&second).await.unwrap();
        let (earlier, later) = if one.started_at <= two.started_at { (one, two) } else { (two, one) };
        assert!(later.started_at.unwrap() >= earlier.finished_at.unwrap());
        // 两个任务复用同一个上下文
        assert_eq!(factory.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_independent_contexts_run_in_parallel() {
        let factory = Arc::new(
            StubDriverFactory::new(StubBehavior::reply("ok", Duration::from_millis(200)))
                .independent_contexts(),
        );
        let c = components(Arc::clone(&factory), Arc::new(MemorySessionStore::new()), 2);
        assert_eq!(c.pool.capacity(), 2);

        let started = Instant::now();
        let mut handles = Vec::new();
        for message in ["a", "b"] {
            let id = c.registry.create(TaskInput::new(message)).await.unwrap();
            handles.push(c.executor.spawn(id));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(started.elapsed() < Duration::from_millis(380));
        assert_eq!(c.registry.counts().await.completed, 2);
        assert_eq!(factory.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_rejected_session_is_invalidated() {
        let factory = Arc::new(StubDriverFactory::new(StubBehavior::RejectAuth));
        let c = components(factory, Arc::new(MemorySessionStore::with_session(signed_in())), 1);

        let id = c.registry.create(TaskInput::new("hi")).await.unwrap();
        let task = c.executor.run(&id).await.unwrap();
        assert_eq!(task.error.unwrap().kind, ErrorKind::Authentication);

        let report = c.sessions.status().await;
        assert!(!report.session_exists);
        assert_eq!(report.state, SessionState::Invalidated);
    }

    #[tokio::test]
    async fn test_listing_keeps_creation_order() {
        let factory = Arc::new(StubDriverFactory::new(StubBehavior::echo()));
        let c = components(factory, Arc::new(MemorySessionStore::new()), 1);

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(c.registry.create(TaskInput::new(format!("m{}", i))).await.unwrap());
        }
        c.executor.run(&ids[1]).await.unwrap();
        c.executor.run(&ids[3]).await.unwrap();

        let listed: Vec<String> = c.registry.list(None, 50).await.map(|t| t.id).collect();
        let expected: Vec<String> = ids.iter().rev().cloned().collect();
        assert_eq!(listed, expected);
        // 状态变化不影响顺序
        let again: Vec<String> = c.registry.list(None, 50).await.map(|t| t.id).collect();
        assert_eq!(again, listed);

        let completed: Vec<String> = c
            .registry
            .list(Some(TaskStatus::Completed), 50)
            .await
            .map(|t| t.id)
            .collect();
        assert_eq!(completed, vec![ids[3].clone(), ids[1].clone()]);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_tasks() {
        let factory = Arc::new(StubDriverFactory::new(StubBehavior::Silent));
        let c = components(Arc::clone(&factory), Arc::new(MemorySessionStore::new()), 1);

        let id = c
            .registry
            .create(TaskInput::new("hang").with_timeout(60))
            .await
            .unwrap();
        let handle = c.executor.spawn(id.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;

        c.executor.shutdown(Duration::from_secs(1)).await;
        handle.await.unwrap().unwrap();
        let task = c.registry.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.unwrap().kind, ErrorKind::Cancelled);

        c.pool.close().await;
        assert!(!c.pool.is_ready());
        assert_eq!(factory.close_count(), factory.launch_count());
    }
}
