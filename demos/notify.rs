//! Notify plugin - fire-and-forget and async handlers.
//!
//! This example demonstrates:
//! - Notify handlers scheduled onto the host execution thread
//! - Async handlers awaiting host requests
//! - Ending the run loop with an exit code through `Shutdown`
//!
//! # Running from Neovim
//!
//! ```vim
//! let chan = jobstart(['./target/debug/examples/notify'], {'rpc': v:true})
//! call Mark('todo')
//! call Stamp()
//! call Quit(3)
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nvimwire::handler::{HandlerRegistry, Mode};
use nvimwire::transport::ServerAddr;
use nvimwire::{Result, RunLoopBuilder, Shutdown, Value};

fn register(registry: &mut HandlerRegistry, shutdown: Shutdown) -> Result<()> {
    let marks = Arc::new(AtomicUsize::new(0));

    registry
        .register(Mode::Notify, Some("Mark"))
        .plain(move |ctx, args| {
            let n = marks.fetch_add(1, Ordering::Relaxed) + 1;
            let label = args.first().and_then(Value::as_str).unwrap_or("mark").to_string();
            ctx.notify(
                "nvim_echo",
                vec![
                    Value::Array(vec![Value::Array(vec![Value::from(format!("{} #{}", label, n))])]),
                    Value::from(false),
                    Value::Map(vec![]),
                ],
            )?;
            Ok(Value::Nil)
        })?;

    registry
        .register(Mode::Async, Some("Stamp"))
        .suspend(|ctx, _args| async move {
            let line = ctx.request("nvim_get_current_line", vec![]).await?;
            let stamped = format!("{} -- stamped", line.as_str().unwrap_or_default());
            ctx.request("nvim_set_current_line", vec![Value::from(stamped)]).await
        })?;

    registry
        .register(Mode::Notify, Some("Quit"))
        .plain(move |_ctx, args| {
            let code = args.first().and_then(Value::as_i64).unwrap_or(0);
            shutdown.trigger(code as i32);
            Ok(Value::Nil)
        })?;

    Ok(())
}

fn main() {
    nvimwire::logging::init();

    let shutdown = Shutdown::new();
    let mut registry = HandlerRegistry::new();
    if let Err(e) = register(&mut registry, shutdown.clone()) {
        eprintln!("invalid handler: {}", e);
        std::process::exit(1);
    }

    let code = match RunLoopBuilder::new(registry)
        .client_name("nvimwire-notify")
        .shutdown(shutdown)
        .connect(&ServerAddr::Stdio)
    {
        Ok(run_loop) => run_loop.main(),
        Err(e) => {
            tracing::error!(error = %e, "failed to start");
            1
        }
    };
    std::process::exit(code);
}
