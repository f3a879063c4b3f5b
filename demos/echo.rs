//! Echo plugin - simple request/response example.
//!
//! This example demonstrates:
//! - Registering blocking handlers with explicit names
//! - Decoding typed arguments with `MsgPackCodec`
//! - Calling back into Neovim from a handler
//!
//! # Running from Neovim
//!
//! ```vim
//! let chan = jobstart(['./target/debug/examples/echo'], {'rpc': v:true})
//! " once started:
//! echo Echo('hello')
//! echo Greet({'name': 'you', 'times': 2})
//! ```

use nvimwire::codec::MsgPackCodec;
use nvimwire::handler::{HandlerRegistry, Mode};
use nvimwire::transport::ServerAddr;
use nvimwire::{BridgeError, Result, RunLoopBuilder, Value};
use serde::Deserialize;

/// Argument of the `Greet` function.
#[derive(Deserialize, Debug)]
struct GreetInput {
    name: String,
    times: usize,
}

fn register(registry: &mut HandlerRegistry) -> Result<()> {
    // Return the first argument unchanged
    registry
        .register(Mode::Blocking, Some("Echo"))
        .plain(|_ctx, args| Ok(args.into_iter().next().unwrap_or(Value::Nil)))?;

    registry
        .register(Mode::Blocking, Some("Greet"))
        .plain(|ctx, args| {
            let (input,): (GreetInput,) = MsgPackCodec::decode_args(&args)?;
            if input.times == 0 {
                return Err(BridgeError::handler("times must be positive"));
            }

            // Reentrant call into the host while it waits for our reply
            let buffer = ctx.request_blocking("nvim_buf_get_name", vec![Value::from(0)])?;
            let greeting = vec![format!("hello {}", input.name); input.times].join(", ");
            Ok(Value::from(format!("{} from {}", greeting, buffer)))
        })?;

    Ok(())
}

fn main() {
    nvimwire::logging::init();

    let mut registry = HandlerRegistry::new();
    if let Err(e) = register(&mut registry) {
        eprintln!("invalid handler: {}", e);
        std::process::exit(1);
    }

    // jobstart(..., {'rpc': v:true}) speaks msgpack-RPC over our stdio
    let code = match RunLoopBuilder::new(registry).connect(&ServerAddr::Stdio) {
        Ok(run_loop) => run_loop.main(),
        Err(e) => {
            tracing::error!(error = %e, "failed to start");
            1
        }
    };
    std::process::exit(code);
}
