use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use groupcast::config::GroupsConfig;
use groupcast::group::groups::Groups;
use groupcast::membership::membership_events::MembershipEvent;
use groupcast::messaging::message::{Message, MessageListener};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tracing::{error, info, Level};

/// Joins a group and sends every line from stdin as a message to the group's other members
#[derive(Parser)]
struct Args {
    group: String,

    #[clap(long, default_value = "239.255.42.99:7447")]
    multicast_addr: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct PrintingListener {}

#[async_trait]
impl MessageListener for PrintingListener {
    async fn on_message(&self, message: Arc<Message>) {
        println!("{:?}: {}", message.sender(), String::from_utf8_lossy(message.payload()));
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let multicast_addr: SocketAddr = args.multicast_addr.parse()?;
    let groups = Groups::bind(GroupsConfig::new(multicast_addr))?;

    let member = groups.join_group(&args.group).await?;
    member.add_message_listener(Arc::new(PrintingListener {})).await?;
    info!("joined group {:?} as {:?}", args.group, member.id());

    let mut membership_events = member.subscribe_membership_events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let mut message = member.create_new_message();
                message.set_payload(line.into_bytes());
                if let Err(e) = member.send_message(&message).await {
                    error!("sending failed: {}", e);
                }
            }
            evt = membership_events.recv() => {
                match evt {
                    Ok(MembershipEvent::MemberJoined(id)) => info!("{:?} joined", id),
                    Ok(MembershipEvent::MemberLeft(id)) => info!("{:?} left", id),
                    Ok(MembershipEvent::MemberExpired(id)) => info!("{:?} is unreachable", id),
                    Err(_) => {}
                }
                for m in member.get_member_info().await {
                    info!("  {:?} local={} alive={}", m.member_id, m.is_local, m.is_alive);
                }
            }
        }
    }

    groups.shutdown().await;
    Ok(())
}
