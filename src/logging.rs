//! Logging backend which writes to a file (or stderr) and, in debug builds, to a UDP sink.

use chrono::Local;
use log::{Level, Metadata, Record};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::{
    fs::File,
    io::Write,
    net,
    sync::{mpsc, Mutex},
};

use crate::config::RuntimeConfig;

#[derive(Serialize)]
struct Message {
    module: String,
    level: &'static str,
    text: String,
    time: String,
}

impl Message {
    fn write_line(&self, out: &mut impl Write) {
        // [date time] [module] [level] Text
        let _ = out.write_fmt(format_args!(
            "[{}] [{}] [{}] {}\n",
            self.time, self.module, self.level, self.text
        ));
    }
}

pub struct Logger;

impl Logger {
    fn commit(&self, record: &Record) {
        let level = match record.level() {
            Level::Error => "error",
            Level::Warn => "warning",
            Level::Info => "info",
            Level::Debug | Level::Trace => "debug",
        };

        let module = match record.module_path() {
            Some(path) => path.split("::").last().unwrap_or("unknown").to_string(),
            None => return,
        };

        let message = Message {
            module,
            level,
            text: format!("{}", record.args()),
            time: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        };

        // Logging from here on channel failure would recurse, so fall back to stderr.
        if let Some(Err(err)) = MSG_SENDER.get().map(|s| s.lock().map(|s| s.send(message))) {
            eprintln!("graft: error in log sender chain: {err}");
        }
    }
}

impl log::Log for Logger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.commit(record);
        }
    }

    fn flush(&self) {}
}

static LOGGER: Logger = Logger;
static MSG_SENDER: OnceCell<Mutex<mpsc::Sender<Message>>> = OnceCell::new();

fn panic_hook(info: &std::panic::PanicInfo) {
    let message = info
        .payload()
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| info.payload().downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "no message".to_string());

    let backtrace = std::backtrace::Backtrace::force_capture();

    // The hook must not unwind, so everything here is best-effort.
    log::error!("panic in patch runtime: {message}\n{backtrace}");
    eprintln!("graft panic: {message}");
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(panic_hook));
}

/// Starts the background log writer. Safe to call more than once; later calls are ignored.
pub fn init(config: &RuntimeConfig) {
    if log::set_logger(&LOGGER)
        .map(|_| log::set_max_level(log::LevelFilter::max()))
        .is_err()
    {
        // Another logger is installed (common in embedding tests). Leave it alone.
        return;
    }

    install_panic_hook();

    let (sender, receiver) = mpsc::channel();

    if MSG_SENDER.set(Mutex::new(sender)).is_err() {
        return;
    }

    // Only attempt to connect over UDP if we're in debug mode.
    let socket = if cfg!(feature = "debug") {
        net::UdpSocket::bind("0.0.0.0:0").ok()
    } else {
        None
    };

    let sink_addr = config.log_sink_addr.clone();
    let mut file = config.log_path.as_ref().and_then(|p| File::create(p).ok());

    // Receive log messages on a background thread so that writing to files/sockets never slows
    // down patch application in host code.
    std::thread::spawn(move || {
        while let Ok(msg) = receiver.recv() {
            match &mut file {
                Some(file) => msg.write_line(file),
                None => msg.write_line(&mut std::io::stderr()),
            }

            if let (Some(socket), Some(addr)) = (&socket, &sink_addr) {
                if let Ok(bin) = serde_json::to_vec(&msg) {
                    let _ = socket.send_to(&bin, addr.as_str());
                }
            }
        }
    });
}
