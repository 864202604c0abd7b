//! Entry point: parses arguments, loads configuration, optionally forks
//! into the background, then wires up the TCP listener, the USB and
//! RS-485 stacks and the routing core onto a single event reactor.

mod config;
mod daemonize;
mod signal;

use clap::{App, Arg};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use bridge_core::client::{Client, ClientId};
use bridge_core::io::{CharDeviceIo, IoStream, Status, TcpIo};
use bridge_core::packet::{Packet, PacketBuilder, FUNCTION_NOT_SUPPORTED};
use bridge_core::reactor::{Interest, Reactor, SourceType};
use bridge_core::stack::{Recipient, StackId};
use bridge_core::Router;
use rs485_stack::{CrcErrorCounter, Master, MasterEvent};
use support::logging;
use support::pidfile::PidFile;

use config::DaemonConfig;

/// RS-485 stacks live in the same `StackId` space as USB stacks; offsetting
/// them well past any realistic USB device count keeps the two disjoint
/// without needing a tagged union everywhere a `StackId` is passed around.
const RS485_STACK_ID_BASE: StackId = 1_000_000;

fn main() {
    let matches = App::new("bridged")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Bridges network clients to attached USB and RS-485 hardware.")
        .arg(
            Arg::with_name("config")
                .long("config")
                .takes_value(true)
                .default_value("/etc/bridged.conf")
                .help("Path to the configuration file"),
        )
        .arg(
            Arg::with_name("pid-file")
                .long("pid-file")
                .takes_value(true)
                .help("Overrides the pid file path from the config file"),
        )
        .arg(Arg::with_name("daemon").long("daemon").help("Fork into the background"))
        .arg(
            Arg::with_name("verbosity")
                .long("verbosity")
                .takes_value(true)
                .help("Overrides the log.level config key (error, warn, info, debug, trace)"),
        )
        .get_matches();

    let config_path = matches.value_of("config").unwrap();
    let mut config = DaemonConfig::load(config_path).unwrap_or_else(|err| {
        eprintln!("Could not read config file '{}': {}", config_path, err);
        std::process::exit(1);
    });

    if let Some(pid_file) = matches.value_of("pid-file") {
        config.pid_file_path = pid_file.to_string();
    }
    if let Some(verbosity) = matches.value_of("verbosity") {
        config.log_level = verbosity.to_string();
    }

    if matches.is_present("daemon") {
        if let Err(err) = daemonize::daemonize() {
            eprintln!("Could not daemonize: {}", err);
            std::process::exit(1);
        }
    }

    let log = logging::init(&config.log_level, config.log_destination, config.log_file_path.as_deref());

    let pid_file = match PidFile::acquire(&config.pid_file_path) {
        Ok(pid_file) => pid_file,
        Err(err) => {
            logging::error!(log, "could not acquire pid file"; "path" => &config.pid_file_path, "error" => ?err);
            std::process::exit(1);
        }
    };

    logging::info!(log, "starting bridged"; "config" => config_path);

    if let Err(err) = run(config, log.clone()) {
        logging::error!(log, "fatal error"; "error" => %err);
        let _ = pid_file.release();
        std::process::exit(1);
    }

    let _ = pid_file.release();
}

struct ClientConn {
    client: Client,
    io: TcpIo,
}

/// The RS-485 master paired with the serial device it talks over; kept
/// together since every poll/timeout tick needs both.
struct Rs485Link {
    master: Master,
    io: CharDeviceIo,
    fd: RawFd,
}

struct Daemon {
    clients: HashMap<ClientId, ClientConn>,
    next_client_id: ClientId,
    router: Router,
    usb: Option<usb_stack::UsbStackManager>,
    rs485: Option<Rs485Link>,
    /// Learned from responses: which stack a given uid actually lives
    /// behind, so later requests for that uid skip the broadcast fan-out.
    uid_stack: HashMap<u32, StackId>,
    log: slog::Logger,
}

fn run(config: DaemonConfig, log: slog::Logger) -> std::io::Result<()> {
    let mut reactor = Reactor::new(log.clone())?;

    let listener = TcpListener::bind((config.listen_address, config.listen_port))?;
    listener.set_nonblocking(true)?;
    let listener_fd = listener.as_raw_fd();

    let usb = usb_stack::UsbStackManager::new(log.clone()).ok();
    if let Some(usb) = &usb {
        let _ = usb.register_pollfds(&mut reactor);
    }

    let rs485 = build_rs485_link(&config, &log);
    let rs485_fd = rs485.as_ref().map(|link| link.fd);

    let daemon = Rc::new(RefCell::new(Daemon {
        clients: HashMap::new(),
        next_client_id: 1,
        router: Router::new(),
        usb,
        rs485,
        uid_stack: HashMap::new(),
        log: log.clone(),
    }));

    let secret = config.authentication_secret.clone();
    let daemon_for_accept = daemon.clone();

    reactor.add_source(listener_fd, SourceType::Generic, "tcp-listener", Interest::READ)?;
    reactor.set_read_callback(listener_fd, SourceType::Generic, move |reactor| {
        accept_loop(&listener, reactor, &daemon_for_accept, secret.clone());
    });

    if let Some(fd) = rs485_fd {
        reactor.add_source(fd, SourceType::Generic, "rs485-serial", Interest::READ)?;

        let daemon_for_rs485 = daemon.clone();
        reactor.set_read_callback(fd, SourceType::Generic, move |reactor| {
            on_rs485_readable(reactor, &daemon_for_rs485);
        });
    }

    let stop_handle = reactor.stop_handle();
    let (sig_read, sig_write) = self_pipe()?;
    signal::install(sig_write);

    reactor.add_source(sig_read, SourceType::Generic, "signal-pipe", Interest::READ)?;
    reactor.set_read_callback(sig_read, SourceType::Generic, move |_reactor| {
        let mut byte = [0u8; 1];
        unsafe {
            libc::read(sig_read, byte.as_mut_ptr() as *mut libc::c_void, 1);
        }
        match signal::Signal::from(byte[0]) {
            signal::Signal::Interrupt | signal::Signal::Terminate => stop_handle.stop(),
            _ => {}
        }
    });

    let daemon_for_cleanup = daemon.clone();
    reactor.run(move |reactor| {
        let mut daemon = daemon_for_cleanup.borrow_mut();
        let now = support::time::timestamp_secs();
        daemon.router.reap_zombies(now);

        let mut responses: Vec<(StackId, Packet)> = Vec::new();

        if let Some(usb) = &mut daemon.usb {
            usb.handle_events();
            responses.extend(usb.poll_responses());
        }

        if let Some(link) = &mut daemon.rs485 {
            if let MasterEvent::Response { stack_id, packet } = link.master.on_timeout() {
                responses.push((RS485_STACK_ID_BASE + stack_id, packet));
            }

            if link.master.is_idle() {
                let io = &mut link.io;
                let _ = link.master.poll_next_slave(|bytes| write_frame(io, bytes));
            }
        }

        for (stack_id, packet) in responses {
            route_response(&mut daemon, reactor, stack_id, packet);
        }
    })
}

fn build_rs485_link(config: &DaemonConfig, log: &slog::Logger) -> Option<Rs485Link> {
    let device = config.rs485_device.as_ref()?;
    if config.rs485_slaves.is_empty() {
        return None;
    }

    let serial_config = rs485_stack::serial::SerialConfig {
        baudrate: config.rs485_baudrate,
        parity: rs485_stack::serial::Parity::None,
        stopbits: rs485_stack::serial::StopBits::One,
    };

    let fd = match rs485_stack::serial::open(device, &serial_config) {
        Ok(fd) => fd,
        Err(err) => {
            logging::error!(log, "could not open RS-485 device"; "device" => device, "error" => %err);
            return None;
        }
    };

    let crc_counter = CrcErrorCounter::load(&config.rs485_crc_error_count_path)
        .unwrap_or_else(|_| CrcErrorCounter::load("/dev/null").unwrap());
    let master = Master::new(config.rs485_baudrate, &config.rs485_slaves, crc_counter, log.clone());
    let io = unsafe { CharDeviceIo::from_raw_fd(fd, device.clone()) };

    logging::info!(log, "RS-485 master configured"; "device" => device, "baudrate" => config.rs485_baudrate);

    Some(Rs485Link { master, io, fd })
}

/// Best-effort single write of a round-robin/retry frame. RS-485 frames
/// top out at 88 bytes, far under a serial driver's output buffer, so a
/// would-block here is treated as "try again next tick" rather than
/// something worth blocking the reactor thread over.
fn write_frame(io: &mut dyn IoStream, bytes: &[u8]) -> std::io::Result<()> {
    match io.write_nonblocking(bytes)? {
        Status::Progress(_) | Status::WouldBlock => Ok(()),
        Status::Eof => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "RS-485 device closed")),
    }
}

fn on_rs485_readable(reactor: &mut Reactor, daemon: &Rc<RefCell<Daemon>>) {
    let event = {
        let mut daemon_ref = daemon.borrow_mut();
        let log = daemon_ref.log.clone();

        let link = match &mut daemon_ref.rs485 {
            Some(link) => link,
            None => return,
        };

        let mut buf = [0u8; 128];
        match link.io.read_nonblocking(&mut buf) {
            Ok(Status::Progress(n)) => link.master.on_bytes_received(&buf[..n]),
            Ok(Status::WouldBlock) => MasterEvent::Pending,
            Ok(Status::Eof) | Err(_) => {
                logging::error!(log, "RS-485 device closed unexpectedly");
                MasterEvent::Pending
            }
        }
    };

    if let MasterEvent::Response { stack_id, packet } = event {
        let mut daemon_ref = daemon.borrow_mut();
        route_response(&mut daemon_ref, reactor, RS485_STACK_ID_BASE + stack_id, packet);
    }
}

/// Records which stack answered for `packet.uid()` and hands the response
/// off to whichever client (or every authenticated client, for a
/// broadcast-style callback) is waiting on it.
fn route_response(daemon: &mut Daemon, reactor: &mut Reactor, stack_id: StackId, packet: Packet) {
    daemon.uid_stack.insert(packet.uid(), stack_id);

    match daemon.router.resolve_response(&packet, stack_id) {
        Some(Recipient::Client(client_id)) => {
            if let Some(conn) = daemon.clients.get_mut(&client_id) {
                conn.client.enqueue(packet);
            }
            queue_write_interest(daemon, reactor, client_id);
        }
        Some(Recipient::Broadcast) => {
            let ids: Vec<ClientId> = daemon.clients.keys().copied().collect();
            for client_id in ids {
                if let Some(conn) = daemon.clients.get_mut(&client_id) {
                    if conn.client.is_authenticated() {
                        conn.client.enqueue(packet.clone());
                    }
                }
                queue_write_interest(daemon, reactor, client_id);
            }
        }
        None => {
            logging::debug!(daemon.log, "dropping unroutable response"; "stack_id" => stack_id);
        }
    }
}

/// Arms the `WRITE` interest on a client's source once its writer holds
/// queued bytes; the source otherwise stays read-only so an idle client
/// doesn't spin the reactor on a permanently-writable socket.
fn queue_write_interest(daemon: &Daemon, reactor: &mut Reactor, client_id: ClientId) {
    if let Some(conn) = daemon.clients.get(&client_id) {
        if conn.client.has_pending_writes() {
            let _ = reactor.modify_source(conn.client.fd, SourceType::Generic, Interest::empty(), Interest::WRITE);
        }
    }
}

fn accept_loop(listener: &TcpListener, reactor: &mut Reactor, daemon: &Rc<RefCell<Daemon>>, secret: Option<Vec<u8>>) {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(err) = handle_new_connection(stream, addr.to_string(), reactor, daemon, secret.clone()) {
                    let log = daemon.borrow().log.clone();
                    logging::warn!(log, "could not accept client connection"; "error" => %err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(_) => break,
        }
    }
}

fn handle_new_connection(
    stream: TcpStream,
    peer: String,
    reactor: &mut Reactor,
    daemon: &Rc<RefCell<Daemon>>,
    secret: Option<Vec<u8>>,
) -> std::io::Result<()> {
    let io = TcpIo::new(stream)?;
    let fd = io.as_raw_fd();

    let id = {
        let mut daemon_ref = daemon.borrow_mut();
        let id = daemon_ref.next_client_id;
        daemon_ref.next_client_id += 1;

        let client = Client::new(id, fd, peer.clone(), secret);
        logging::info!(daemon_ref.log, "client connected"; "peer" => &peer, "id" => id);
        daemon_ref.clients.insert(id, ClientConn { client, io });
        id
    };

    reactor.add_source(fd, SourceType::Generic, format!("client-{}", id), Interest::READ)?;

    let daemon_for_read = daemon.clone();
    reactor.set_read_callback(fd, SourceType::Generic, move |reactor| {
        on_client_readable(reactor, &daemon_for_read, id);
    });

    let daemon_for_write = daemon.clone();
    reactor.set_write_callback(fd, SourceType::Generic, move |reactor| {
        on_client_writable(reactor, &daemon_for_write, id);
    });

    Ok(())
}

fn on_client_readable(reactor: &mut Reactor, daemon: &Rc<RefCell<Daemon>>, id: ClientId) {
    let mut daemon_ref = daemon.borrow_mut();
    let log = daemon_ref.log.clone();

    let (outcome, fd) = match daemon_ref.clients.get_mut(&id) {
        Some(conn) => {
            let fd = conn.client.fd;
            (conn.client.on_readable(&mut conn.io, &log), fd)
        }
        None => return,
    };

    for packet in outcome.routable {
        dispatch_request(&mut daemon_ref, reactor, id, packet);
    }

    if outcome.disconnect {
        let now = support::time::timestamp_secs();
        daemon_ref.router.disconnect_client(id, now);
        daemon_ref.clients.remove(&id);
        logging::info!(log, "client disconnected"; "id" => id);
        drop(daemon_ref);
        reactor.remove_source(fd, SourceType::Generic);
        return;
    }

    let has_pending = daemon_ref.clients.get(&id).map(|conn| conn.client.has_pending_writes()).unwrap_or(false);
    drop(daemon_ref);

    if has_pending {
        let _ = reactor.modify_source(fd, SourceType::Generic, Interest::empty(), Interest::WRITE);
    }
}

fn on_client_writable(reactor: &mut Reactor, daemon: &Rc<RefCell<Daemon>>, id: ClientId) {
    let mut daemon_ref = daemon.borrow_mut();
    let log = daemon_ref.log.clone();

    let (fd, result) = match daemon_ref.clients.get_mut(&id) {
        Some(conn) => (conn.client.fd, conn.client.flush(&mut conn.io)),
        None => return,
    };

    match result {
        Ok(true) => {
            drop(daemon_ref);
            let _ = reactor.modify_source(fd, SourceType::Generic, Interest::WRITE, Interest::empty());
        }
        Ok(false) => {}
        Err(err) => {
            logging::warn!(log, "write error, disconnecting client"; "id" => id, "error" => %err);
            let now = support::time::timestamp_secs();
            daemon_ref.router.disconnect_client(id, now);
            daemon_ref.clients.remove(&id);
            drop(daemon_ref);
            reactor.remove_source(fd, SourceType::Generic);
        }
    }
}

/// Routes a request packet read from a client to the hardware stack that
/// owns its uid. If the uid hasn't been seen before (including uid 0, the
/// broadcast address `enumerate`-style requests use), the request is fanned
/// out to every attached stack; whichever one actually owns the uid answers
/// and teaches `uid_stack` for next time (see `route_response`).
fn dispatch_request(daemon: &mut Daemon, reactor: &mut Reactor, client_id: ClientId, packet: Packet) {
    if let Some(&stack_id) = daemon.uid_stack.get(&packet.uid()) {
        route_to_stack(daemon, stack_id, client_id, &packet);
        return;
    }

    let mut stack_ids: Vec<StackId> = Vec::new();
    if let Some(usb) = &daemon.usb {
        stack_ids.extend(usb.stack_ids());
    }
    if let Some(link) = &daemon.rs485 {
        stack_ids.extend(link.master.stack_ids().into_iter().map(|id| RS485_STACK_ID_BASE + id));
    }

    if stack_ids.is_empty() {
        if packet.response_expected() {
            enqueue_not_supported(daemon, reactor, client_id, &packet);
        }
        return;
    }

    for stack_id in stack_ids {
        route_to_stack(daemon, stack_id, client_id, &packet);
    }
}

/// Synthesizes a `FUNCTION_NOT_SUPPORTED` reply for a request whose uid no
/// attached stack owns, the way a real peripheral would answer an
/// unsupported function rather than leaving the client hanging.
fn enqueue_not_supported(daemon: &mut Daemon, reactor: &mut Reactor, client_id: ClientId, request: &Packet) {
    let response = match PacketBuilder::new(request.uid(), request.function_id())
        .sequence_number(request.sequence_number())
        .error_code(FUNCTION_NOT_SUPPORTED)
        .build()
    {
        Ok(packet) => packet,
        Err(_) => return,
    };

    if let Some(conn) = daemon.clients.get_mut(&client_id) {
        conn.client.enqueue(response);
    }
    queue_write_interest(daemon, reactor, client_id);
}

fn route_to_stack(daemon: &mut Daemon, stack_id: StackId, client_id: ClientId, packet: &Packet) {
    let dispatched = if stack_id >= RS485_STACK_ID_BASE {
        match &mut daemon.rs485 {
            Some(link) => {
                link.master.enqueue_request(stack_id - RS485_STACK_ID_BASE, packet.clone());
                true
            }
            None => false,
        }
    } else {
        match &mut daemon.usb {
            Some(usb) => usb.dispatch_request(stack_id, packet).is_ok(),
            None => false,
        }
    };

    if dispatched {
        daemon.router.track_request(packet, client_id, stack_id);
    }
}

fn self_pipe() -> std::io::Result<(i32, i32)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(std::io::Error::last_os_error());
    }

    for fd in &fds {
        unsafe {
            let flags = libc::fcntl(*fd, libc::F_GETFL, 0);
            libc::fcntl(*fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }

    Ok((fds[0], fds[1]))
}
