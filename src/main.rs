use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::process;

use clap::Parser;

use tcp_usrreq::protocol::sockopt::{TCP_CONGESTION, TCP_INFO, TcpInfo};
use tcp_usrreq::{Config, Cred, Domain, Message, Result, Shutdown, Socket, Stack, error, info};

/// Drives one connection through the user-request control plane over the
/// in-memory loopback engine.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Congestion module the client switches to once established
    #[arg(short, long, default_value = "cubic")]
    congestion: String,
    /// Port the listener binds
    #[arg(short, long, default_value_t = 8080)]
    port: u16,
    /// Use the IPv6 loopback address
    #[arg(long)]
    v6: bool,
    /// Bytes sent by the client
    #[arg(short, long, default_value_t = 4096)]
    size: usize,
    /// Log filter used when RUST_LOG is unset
    #[arg(short, long, default_value = "debug")]
    log: String,
}

fn main() {
    let args = Args::parse();
    tcp_usrreq::log::init(&args.log);

    if let Err(err) = run(&args) {
        error!("loopback exchange failed: {err} (errno {})", err.errno());
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let stack = Stack::with_loopback(Config::default())?;
    let cred = Cred::root();

    let (domain, ip): (Domain, IpAddr) = if args.v6 {
        (Domain::Inet6, Ipv6Addr::LOCALHOST.into())
    } else {
        (Domain::Inet, Ipv4Addr::LOCALHOST.into())
    };
    let server_addr = SocketAddr::new(ip, args.port);

    let listener = stack.attach(domain)?;
    stack.bind(&listener, server_addr, &cred)?;
    stack.listen(&listener, 16, &cred)?;
    info!("listening on {}", stack.sockaddr(&listener)?);

    let client = stack.attach(domain)?;
    stack.connect(&client, server_addr, &cred)?;
    let client_addr = stack.sockaddr(&client)?;

    // The loopback engine delivers the SYN and both handshakes complete.
    let server = stack.sonewconn(&listener, server_addr, client_addr)?;
    stack.input(&client, |g| g.establish())??;
    stack.input(&server, |g| g.establish())??;

    if let Some(accepted) = listener.take_incoming() {
        info!("accepted connection from {}", stack.accept(&accepted)?);
    }

    let mut name = args.congestion.clone().into_bytes();
    name.push(0);
    stack.setsockopt(&client, &cred, libc::IPPROTO_TCP, TCP_CONGESTION, &name)?;

    stack.send(&client, &cred, Message::new(vec![0u8; args.size]))?;
    report(&stack, &client)?;

    stack.shutdown(&client, Shutdown::Write)?;

    for so in [&client, &server] {
        stack.soclose(so)?;

        // The engine finishes the teardown; the closed socket is reaped.
        stack.input(so, |g| stack.close_locked(g))?;
        info!("[{}] closed, alive: {}", so.id(), so.is_alive());
    }

    stack.soclose(&listener)?;

    Ok(())
}

fn report(stack: &Stack, so: &Socket) -> Result<()> {
    let raw = stack.getsockopt(so, libc::IPPROTO_TCP, TCP_INFO)?;
    let tcp_info = TcpInfo::try_from(&raw[..])?;

    let cc = stack.getsockopt(so, libc::IPPROTO_TCP, TCP_CONGESTION)?;
    let cc = String::from_utf8_lossy(cc.strip_suffix(&[0]).unwrap_or(&cc));

    info!(
        "[{}] congestion {cc}: cwnd {}, mss {}, snd.nxt {}, queued {}",
        so.id(),
        tcp_info.snd_cwnd,
        tcp_info.snd_mss,
        tcp_info.snd_nxt,
        tcp_info.snd_queued
    );

    Ok(())
}
