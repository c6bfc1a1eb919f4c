use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use clap::Parser;
use emblink_common::bus::{ByteSink, SendError as BusSendError};
use emblink_common::time::Clock;
use emblink_common::dev_info;
use emblink_link::DefaultLinkTimings;
use emblink_transport::{PortHandlers, Transport, TransportEvent};
use nix::time::{clock_gettime, ClockId};
use serial2::{CharSize, FlowControl, Parity, SerialPort, Settings, StopBits};

const APP_PORT: u8 = 1;
const TX_WIN: usize = 8;
const RX_WIN: usize = 8;

#[derive(Parser, Debug)]
struct Args {
    /// Serial device to open, e.g. /dev/ttyUSB0
    port: String,
    /// Baud rate to configure the port at
    baud_rate: u32,
    /// Send a counter message on the application port every `interval_ms`
    #[clap(long)]
    send: bool,
    /// Interval between sent messages, in milliseconds
    #[clap(long, default_value_t = 500)]
    interval_ms: u64,
}

#[derive(Clone)]
struct MonotonicClock;

impl Clock for MonotonicClock {
    fn current_nanos(&self) -> u64 {
        let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).expect("clock_gettime(CLOCK_MONOTONIC)");
        ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64
    }
}

/// Wraps a [`SerialPort`] for outgoing frame bytes. The port is configured
/// with a zero read timeout and writes block for as long as the OS takes to
/// accept them, so `send_available` always reports room and `send` never
/// returns `WouldBlock` in practice -- on a host UART the write side is
/// effectively unbounded compared to the link's own window sizes.
struct SerialSink {
    port: Arc<SerialPort>,
}

impl ByteSink for SerialSink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), BusSendError> {
        use std::io::Write;
        (&*self.port).write_all(bytes).map_err(|_| BusSendError::WouldBlock)
    }

    fn send_available(&self) -> usize {
        usize::MAX
    }
}

fn configure_port(path: &str, baud_rate: u32) -> SerialPort {
    let mut port = SerialPort::open(path, |mut settings: Settings| {
        settings.set_raw();
        settings.set_baud_rate(baud_rate)?;
        settings.set_char_size(CharSize::Bits8);
        settings.set_parity(Parity::None);
        settings.set_stop_bits(StopBits::One);
        settings.set_flow_control(FlowControl::None);
        Ok(settings)
    })
    .expect("failed to open serial port");
    port.set_read_timeout(Duration::from_millis(20)).expect("set_read_timeout");
    port
}

/// Reads bytes off the port on a dedicated thread and forwards them to the
/// main loop through a channel, so the main loop never blocks on I/O while
/// it still has link timers to drive.
fn spawn_reader(port: Arc<SerialPort>) -> mpsc::Receiver<u8> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = [0u8; 256];
        loop {
            match port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    for &b in &buf[..n] {
                        if tx.send(b).is_err() {
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => {
                    log::error!("serial read error: {e}");
                    return;
                }
            }
        }
    });
    rx
}

fn on_app_recv(_user_data: usize, port_id: u8, port_data: u16, msg: &[u8]) {
    log::info!("recv port={port_id} port_data={port_data} len={} bytes={:02x?}", msg.len(), msg);
}

fn on_app_event(_user_data: usize, event: TransportEvent) {
    log::info!("transport event: {event:?}");
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let port = Arc::new(configure_port(&args.port, args.baud_rate));
    let rx_bytes = spawn_reader(Arc::clone(&port));

    let clock = MonotonicClock;
    let sink = SerialSink { port: Arc::clone(&port) };
    let mut transport: Transport<DefaultLinkTimings, MonotonicClock, SerialSink, TX_WIN, RX_WIN> =
        Transport::new(sink, clock.clone());

    transport
        .register(
            APP_PORT,
            PortHandlers {
                event_fn: Some(on_app_event),
                recv_fn: Some(on_app_recv),
                user_data: 0,
                meta_json: Some(r#"{"name":"emblink-tester"}"#),
            },
        )
        .expect("registering the application port");

    dev_info!("emblink-tester: opened {} at {} baud", args.port, args.baud_rate);

    let mut pending: VecDeque<u8> = VecDeque::new();
    let mut counter: u32 = 0;
    let mut last_sent = clock.current_instant();

    loop {
        while let Ok(byte) = rx_bytes.try_recv() {
            pending.push_back(byte);
        }
        while let Some(byte) = pending.pop_front() {
            transport.recv_byte(byte);
        }

        transport.process();

        if args.send && last_sent.elapsed_ms(&clock) >= args.interval_ms as u32 {
            let payload = counter.to_le_bytes();
            match transport.send(APP_PORT, 0, &payload) {
                Ok(()) => {
                    dev_info!("emblink-tester: sent counter {counter}");
                    counter = counter.wrapping_add(1);
                }
                Err(e) => log::warn!("send failed: {e:?}"),
            }
            last_sent = clock.current_instant();
        }

        thread::sleep(Duration::from_millis(1));
    }
}
