//! Integration tests for nvimwire.
//!
//! A scripted fake Neovim runs on its own thread at the far end of an
//! in-memory duplex stream and plays the host side of the protocol.

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use nvimwire::codec::MsgPackCodec;
use nvimwire::handler::{HandlerRegistry, Mode};
use nvimwire::protocol::{MessageBuffer, RpcMessage};
use nvimwire::{BridgeConfig, BridgeError, Host, RunLoopBuilder, Shutdown, Value};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Host end of the connection.
struct FakeNvim {
    stream: DuplexStream,
    buffer: MessageBuffer,
    queued: VecDeque<RpcMessage>,
}

impl FakeNvim {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buffer: MessageBuffer::new(),
            queued: VecDeque::new(),
        }
    }

    /// Next message from the plugin, skipping log echoes. `None` on EOF.
    async fn recv(&mut self) -> Option<RpcMessage> {
        let mut buf = vec![0u8; 4096];
        loop {
            while let Some(message) = self.queued.pop_front() {
                match &message {
                    RpcMessage::Notification { method, .. } if method == "nvim_echo" => continue,
                    _ => return Some(message),
                }
            }
            let n = self.stream.read(&mut buf).await.unwrap();
            if n == 0 {
                return None;
            }
            self.queued.extend(self.buffer.push(&buf[..n]).unwrap());
        }
    }

    async fn send(&mut self, message: RpcMessage) {
        let bytes = MsgPackCodec::encode(&message.into_value()).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    async fn reply(&mut self, msgid: u64, result: Value) {
        self.send(RpcMessage::Response {
            msgid,
            error: Value::Nil,
            result,
        })
        .await;
    }

    /// Expect a request for `method`, return its id and params.
    async fn expect_request(&mut self, method: &str) -> (u64, Vec<Value>) {
        match self.recv().await {
            Some(RpcMessage::Request {
                msgid,
                method: m,
                params,
            }) if m == method => (msgid, params),
            other => panic!("expected request {}, got {:?}", method, other),
        }
    }

    /// Expect a notification for `method`, return its params.
    async fn expect_notification(&mut self, method: &str) -> Vec<Value> {
        match self.recv().await {
            Some(RpcMessage::Notification { method: m, params }) if m == method => params,
            other => panic!("expected notification {}, got {:?}", method, other),
        }
    }

    /// Answer the client handshake with `chan`; return the glue batch.
    async fn handshake(&mut self, chan: i64) -> Vec<(String, Vec<Value>)> {
        let info = self.expect_notification("nvim_set_client_info").await;
        assert_eq!(info[0], Value::from("nvimwire-test"));

        let (msgid, _) = self.expect_request("nvim_get_api_info").await;
        self.reply(msgid, Value::Array(vec![Value::from(chan), Value::Map(vec![])]))
            .await;

        let (msgid, params) = self.expect_request("nvim_call_atomic").await;
        let calls: Vec<(String, Vec<Value>)> = params[0]
            .as_array()
            .unwrap()
            .iter()
            .map(|call| {
                let call = call.as_array().unwrap();
                (
                    call[0].as_str().unwrap().to_string(),
                    call[1].as_array().unwrap().clone(),
                )
            })
            .collect();
        let results = Value::Array(vec![Value::Nil; calls.len()]);
        self.reply(msgid, Value::Array(vec![results, Value::Nil])).await;
        calls
    }

    /// Call a plugin procedure, return `(error, result)`.
    async fn call(&mut self, msgid: u64, name: &str, args: Vec<Value>) -> (Value, Value) {
        self.send(RpcMessage::Request {
            msgid,
            method: name.to_string(),
            params: vec![Value::Array(args)],
        })
        .await;
        self.response(msgid).await
    }

    async fn response(&mut self, id: u64) -> (Value, Value) {
        match self.recv().await {
            Some(RpcMessage::Response {
                msgid,
                error,
                result,
            }) if msgid == id => (error, result),
            other => panic!("expected response {}, got {:?}", id, other),
        }
    }

    async fn notify(&mut self, name: &str, args: Vec<Value>) {
        self.send(RpcMessage::Notification {
            method: name.to_string(),
            params: vec![Value::Array(args)],
        })
        .await;
    }
}

/// Run `script` against a fake host on its own thread.
fn spawn_fake<F, Fut, T>(stream: DuplexStream, script: F) -> thread::JoinHandle<T>
where
    F: FnOnce(FakeNvim) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = T>,
    T: Send + 'static,
{
    thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(script(FakeNvim::new(stream)))
    })
}

fn test_host() -> (Host, DuplexStream) {
    let (ours, theirs) = duplex(256 * 1024);
    let (reader, writer) = tokio::io::split(ours);
    let host = Host::from_stream(reader, writer, &BridgeConfig::default()).unwrap();
    (host, theirs)
}

fn test_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    registry
        .register(Mode::Blocking, Some("echo"))
        .plain(|_ctx, args| Ok(args.into_iter().next().unwrap_or(Value::Nil)))
        .unwrap();

    registry
        .register(Mode::Blocking, Some("boom"))
        .plain(|_ctx, _args| Err(BridgeError::handler("kaboom")))
        .unwrap();

    // Reentrant call back into the host from the listener thread
    registry
        .register(Mode::Blocking, Some("CurrentMode"))
        .plain(|ctx, _args| ctx.request_blocking("nvim_get_mode", vec![]))
        .unwrap();

    registry
        .register(Mode::Notify, Some("Touch"))
        .plain(|ctx, args| {
            let on_host = ctx.executor().is_host_thread();
            ctx.notify(
                "nvim_command",
                vec![Value::from(format!("echo {} {}", on_host, Value::Array(args)))],
            )?;
            Ok(Value::Nil)
        })
        .unwrap();

    registry
        .register(Mode::Async, Some("Later"))
        .suspend(|ctx, _args| async move {
            let name = ctx.request("nvim_buf_get_name", vec![Value::from(0)]).await?;
            let text = name.as_str().unwrap_or_default().to_string();
            ctx.notify("nvim_command", vec![Value::from(format!("edit {}", text))])?;
            Ok(Value::Nil)
        })
        .unwrap();

    registry
}

#[test]
fn test_full_session() {
    let (host, theirs) = test_host();

    let fake = spawn_fake(theirs, |mut nvim| async move {
        let glue = nvim.handshake(7).await;

        // Blocking passthrough
        let (error, result) = nvim.call(100, "echo", vec![Value::from("hi")]).await;
        assert_eq!(error, Value::Nil);
        assert_eq!(result, Value::from("hi"));

        // Handler failure reaches the host as a failed request
        let (error, result) = nvim.call(101, "boom", vec![]).await;
        assert_eq!(result, Value::Nil);
        let text = error.as_str().unwrap().to_string();
        assert!(text.contains("boom"), "{}", text);
        assert!(text.contains("kaboom"), "{}", text);

        // Unknown procedure answers nil
        let (error, result) = nvim.call(102, "nope", vec![]).await;
        assert_eq!((error, result), (Value::Nil, Value::Nil));

        // Reentrant blocking call
        nvim.send(RpcMessage::Request {
            msgid: 103,
            method: "CurrentMode".to_string(),
            params: vec![Value::Array(vec![])],
        })
        .await;
        let (msgid, _) = nvim.expect_request("nvim_get_mode").await;
        let mode = Value::Map(vec![(Value::from("mode"), Value::from("n"))]);
        nvim.reply(msgid, mode.clone()).await;
        assert_eq!(nvim.response(103).await, (Value::Nil, mode));

        // Notify body runs on the host execution thread
        nvim.notify("Touch", vec![Value::from(1)]).await;
        let params = nvim.expect_notification("nvim_command").await;
        assert_eq!(params, vec![Value::from("echo true [1]")]);

        // Async body awaits a host request
        nvim.notify("Later", vec![]).await;
        let (msgid, params) = nvim.expect_request("nvim_buf_get_name").await;
        assert_eq!(params, vec![Value::from(0)]);
        nvim.reply(msgid, Value::from("/tmp/notes.md")).await;
        let params = nvim.expect_notification("nvim_command").await;
        assert_eq!(params, vec![Value::from("edit /tmp/notes.md")]);

        glue
    });

    let run_loop = RunLoopBuilder::new(test_registry())
        .client_name("nvimwire-test")
        .attach(host)
        .unwrap();

    // The fake drops its end when the script is done
    assert_eq!(run_loop.main(), 0);

    let glue = fake.join().unwrap();
    assert_eq!(glue.len(), 10);

    let sources: Vec<&str> = glue.iter().map(|(_, args)| args[0].as_str().unwrap()).collect();
    assert_eq!(glue[0].0, "nvim_exec_lua");
    assert_eq!(
        sources[0],
        "CurrentMode = function (...) return vim.rpcrequest(7, 'CurrentMode', {...}) end"
    );
    assert_eq!(glue[1].0, "nvim_exec2");
    assert!(sources[1].starts_with("function! CurrentMode(...)"));
    assert!(sources.contains(&"Later = function (...) return vim.rpcnotify(7, 'Later', {...}) end"));
    assert!(sources.contains(&"echo = function (...) return vim.rpcrequest(7, 'echo', {...}) end"));
}

#[test]
fn test_wait_resolved_with_exit_code() {
    let (host, theirs) = test_host();
    let shutdown = Shutdown::new();

    let fake = spawn_fake(theirs, |mut nvim| async move {
        nvim.handshake(3).await;
        // Hold the connection until the plugin side goes away
        while nvim.recv().await.is_some() {}
    });

    let run_loop = RunLoopBuilder::new(test_registry())
        .client_name("nvimwire-test")
        .shutdown(shutdown.clone())
        .attach(host)
        .unwrap();

    let trigger = shutdown.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        trigger.trigger(2);
    });

    assert_eq!(run_loop.main(), 2);
    assert_eq!(shutdown.code(), Some(2));
    fake.join().unwrap();
}

#[test]
fn test_failed_glue_install_surfaces() {
    let (host, theirs) = test_host();

    let fake = spawn_fake(theirs, |mut nvim| async move {
        nvim.expect_notification("nvim_set_client_info").await;
        let (msgid, _) = nvim.expect_request("nvim_get_api_info").await;
        nvim.reply(msgid, Value::Array(vec![Value::from(1), Value::Map(vec![])]))
            .await;

        let (msgid, _) = nvim.expect_request("nvim_call_atomic").await;
        let error = Value::Array(vec![Value::from(1), Value::from(0), Value::from("E121: bad glue")]);
        nvim.reply(msgid, Value::Array(vec![Value::Array(vec![Value::Nil]), error]))
            .await;
    });

    let err = RunLoopBuilder::new(test_registry())
        .client_name("nvimwire-test")
        .attach(host)
        .err()
        .unwrap();

    match err {
        BridgeError::Host(text) => {
            assert!(text.contains("nvim_exec2"), "{}", text);
            assert!(text.contains("E121"), "{}", text);
        }
        other => panic!("unexpected {:?}", other),
    }
    fake.join().unwrap();
}

#[test]
fn test_nested_request_while_blocked() {
    let (host, theirs) = test_host();

    let mut registry = HandlerRegistry::new();
    registry
        .register(Mode::Blocking, Some("Outer"))
        .plain(|ctx, _args| {
            let inner = ctx.request_blocking(
                "nvim_call_function",
                vec![Value::from("Inner"), Value::Array(vec![])],
            )?;
            Ok(Value::from(format!("outer({})", inner.as_str().unwrap_or_default())))
        })
        .unwrap();
    registry
        .register(Mode::Blocking, Some("Inner"))
        .plain(|_ctx, _args| Ok(Value::from("inner")))
        .unwrap();

    let fake = spawn_fake(theirs, |mut nvim| async move {
        nvim.handshake(5).await;

        nvim.send(RpcMessage::Request {
            msgid: 1,
            method: "Outer".to_string(),
            params: vec![Value::Array(vec![])],
        })
        .await;
        let (msgid, params) = nvim.expect_request("nvim_call_function").await;
        assert_eq!(params[0], Value::from("Inner"));

        // Evaluating the function calls back into the plugin
        let (error, result) = nvim.call(2, "Inner", vec![]).await;
        assert_eq!((error, result), (Value::Nil, Value::from("inner")));

        nvim.reply(msgid, Value::from("inner")).await;
        assert_eq!(
            nvim.response(1).await,
            (Value::Nil, Value::from("outer(inner)"))
        );
    });

    let run_loop = RunLoopBuilder::new(registry)
        .client_name("nvimwire-test")
        .attach(host)
        .unwrap();

    assert_eq!(run_loop.main(), 0);
    fake.join().unwrap();
}

#[test]
fn test_malformed_host_message_exits_nonzero() {
    let (host, theirs) = test_host();

    let fake = spawn_fake(theirs, |mut nvim| async move {
        nvim.handshake(4).await;
        let garbage = MsgPackCodec::encode(&Value::from(42)).unwrap();
        nvim.stream.write_all(&garbage).await.unwrap();
        // Hold the connection until the plugin side goes away
        while nvim.recv().await.is_some() {}
    });

    let run_loop = RunLoopBuilder::new(test_registry())
        .client_name("nvimwire-test")
        .attach(host)
        .unwrap();

    assert_ne!(run_loop.main(), 0);
    fake.join().unwrap();
}
