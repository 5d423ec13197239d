use std::sync::Arc;

use futures::future::try_join_all;
use log::debug;
use tokio::runtime::Builder;

use laces::config::load_configs;
use laces::server::start_listener;
use laces::{Channel, CommsHandler, CommsHandlerFactory, SessionHandle};

/// Echoes every byte it receives back to the peer.
struct EchoHandler {
    handle: Option<SessionHandle>,
    pending: Vec<u8>,
}

impl EchoHandler {
    fn new() -> Self {
        Self {
            handle: None,
            pending: vec![],
        }
    }

    fn flush_pending(&mut self, channel: &mut dyn Channel) {
        while !self.pending.is_empty() {
            match channel.write(&self.pending) {
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.handle.as_ref().unwrap().select_for_write();
                    return;
                }
                Err(_) => {
                    self.pending.clear();
                    return;
                }
            }
        }
    }
}

impl CommsHandler for EchoHandler {
    fn on_accept(&mut self, _channel: &mut dyn Channel, handle: SessionHandle) {
        handle.select_for_read();
        self.handle = Some(handle);
    }

    fn on_connect(&mut self, _channel: &mut dyn Channel, handle: SessionHandle) {
        handle.select_for_read();
        self.handle = Some(handle);
    }

    fn on_read(&mut self, channel: &mut dyn Channel) {
        let mut buf = [0u8; 1024];
        loop {
            match channel.read(&mut buf) {
                Ok(0) => {
                    self.handle.as_ref().unwrap().close();
                    return;
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.handle.as_ref().unwrap().close();
                    return;
                }
            }
        }
        self.flush_pending(channel);
        self.handle.as_ref().unwrap().select_for_read();
    }

    fn on_write(&mut self, channel: &mut dyn Channel) {
        self.flush_pending(channel);
    }

    fn closing(&mut self, _channel: &mut dyn Channel) {}
}

struct EchoHandlerFactory;

impl CommsHandlerFactory for EchoHandlerFactory {
    fn create_handler(&self) -> Box<dyn CommsHandler> {
        Box::new(EchoHandler::new())
    }
}

fn print_usage_and_exit(arg0: String) {
    eprintln!(
        "Usage: {} [--threads/-t N] <config filename> [config filename] [..]",
        arg0
    );
    std::process::exit(1);
}

fn main() {
    env_logger::init();

    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);
    let mut num_threads = 0usize;

    while !args.is_empty() && args[0].starts_with('-') {
        if args[0] == "--threads" || args[0] == "-t" {
            args.remove(0);
            if args.is_empty() {
                eprintln!("Missing threads argument.");
                print_usage_and_exit(arg0);
                return;
            }
            num_threads = match args.remove(0).parse::<usize>() {
                Ok(n) => n,
                Err(e) => {
                    eprintln!("Invalid thread count: {}", e);
                    print_usage_and_exit(arg0);
                    return;
                }
            };
        } else {
            eprintln!("Invalid argument: {}", args[0]);
            print_usage_and_exit(arg0);
            return;
        }
    }

    if args.is_empty() {
        print_usage_and_exit(arg0);
        return;
    }

    if num_threads == 0 {
        num_threads = std::cmp::max(
            2,
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        );
        debug!("Runtime threads: {}", num_threads);
    } else {
        println!("Using custom thread count ({})", num_threads);
    }

    let runtime = Builder::new_multi_thread()
        .worker_threads(num_threads)
        .enable_io()
        .enable_time()
        .build()
        .expect("Could not build tokio runtime");

    runtime.block_on(async move {
        let configs = match load_configs(&args).await {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}\n", e);
                print_usage_and_exit(arg0);
                return;
            }
        };

        println!("\nStarting {} echo listener(s)..", configs.len());

        let factory: Arc<dyn CommsHandlerFactory> = Arc::new(EchoHandlerFactory);
        let mut join_handles = Vec::with_capacity(configs.len());
        for config in configs {
            join_handles.push(start_listener(config, factory.clone()).await.unwrap());
        }

        // Die on any listener error.
        try_join_all(join_handles).await.unwrap();
    });
}
