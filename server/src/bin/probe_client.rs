use clap::Parser;
use shared::command::{encode_disconnect, encode_move, encode_string_command, MoveCommand};
use shared::frame::{decode_control_frame, encode_datagram, ServerReply};
use shared::handshake::connect_request;
use shared::{MAX_DATAGRAM, NETFLAG_UNRELIABLE, NET_PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

/// Connects to a server, sends a few moves and disconnects again.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Rendezvous address of the server
        #[clap(short, long, default_value = "127.0.0.1:8080")]
        server: SocketAddr,
        /// Number of move commands to send
        #[clap(short, long, default_value = "10")]
        moves: u32,
        /// Console line to send after the moves
        #[clap(short, long)]
        command: Option<String>,
        /// Protocol version to announce
        #[clap(long, default_value_t = NET_PROTOCOL_VERSION)]
        version: u8,
        /// Milliseconds between datagrams
        #[clap(long, default_value = "100")]
        interval: u64,
    }

    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    // Handshake on the rendezvous port
    println!("Sending connect request to {}", args.server);
    socket.send_to(&connect_request(args.version), args.server).await?;

    let mut buf = [0u8; MAX_DATAGRAM];
    let (len, from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await??;
    println!("Received {} bytes from {}", len, from);

    let frame = decode_control_frame(&buf[..len])?;
    let port = match ServerReply::from_frame(&frame)? {
        ServerReply::Accept { port } => port,
        ServerReply::Reject { reason } => {
            println!("Connection rejected: {}", reason.trim_end());
            return Ok(());
        }
    };
    let session_addr = SocketAddr::new(args.server.ip(), port);
    println!("Connection accepted, session on {}", session_addr);

    let mut sequence = 0u32;
    let interval = Duration::from_millis(args.interval);

    for i in 0..args.moves {
        let cmd = MoveCommand {
            ping: i as f32 * 0.01,
            angles: [0, (i % 128) as i8, 0],
            movement: [200, 0, 0],
            ..MoveCommand::default()
        };
        let data = encode_datagram(NETFLAG_UNRELIABLE, sequence, &encode_move(&cmd)?);
        println!("Sending move #{}: {:?}", sequence, cmd);
        socket.send_to(&data, session_addr).await?;
        sequence += 1;
        sleep(interval).await;
    }

    if let Some(line) = &args.command {
        let data = encode_datagram(NETFLAG_UNRELIABLE, sequence, &encode_string_command(line));
        println!("Sending console command #{}: {}", sequence, line);
        socket.send_to(&data, session_addr).await?;
        sequence += 1;
        sleep(interval).await;
    }

    let data = encode_datagram(NETFLAG_UNRELIABLE, sequence, &encode_disconnect());
    println!("Sending disconnect");
    socket.send_to(&data, session_addr).await?;

    println!("Probe client finished");
    Ok(())
}
