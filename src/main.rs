use aware::{
    ChatMessage, ChatSession, ConnectionState, DiscoveryTransport, KeepAliveConfig,
    LivenessConfig, MemoryMesh, MemoryMessageStore, P2pConfig, P2pTransport, SessionConfig,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};

mod logging;

use logging::{LogLevel, LoggingConfig};

/// 运行模式
enum Mode {
    /// 进程内模拟两台设备
    Simulate,
    /// 通过局域网主持房间
    Host(String),
    /// 通过局域网搜索并加入房间
    Join,
}

/// CLI 参数配置
struct CliArgs {
    user_name: String,
    mode: Mode,
    log_level: LogLevel,
}

fn print_usage(program_name: &str) {
    println!("用法: {} <用户名> <模式> [选项]", program_name);
    println!();
    println!("模式:");
    println!("  --simulate           在进程内模拟主机和客户端，演示握手、聊天和静默断线");
    println!("  --host <房间名>      在局域网内主持一个房间");
    println!("  --join               搜索局域网内的房间并加入");
    println!();
    println!("选项:");
    println!("  --log-level <级别>   日志级别: trace/debug/info/warn/error（默认 info）");
    println!("  --verbose, -v        同时把日志输出到标准错误");
    println!("  --help, -h           显示帮助信息");
    println!();
    println!("示例:");
    println!("  {} Alice --simulate", program_name);
    println!("  {} Alice --host 客厅", program_name);
    println!("  {} Bob --join", program_name);
}

fn parse_args() -> (CliArgs, bool) {
    let args: Vec<String> = env::args().collect();
    let program = args.first().cloned().unwrap_or_else(|| "lchat".to_string());

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_usage(&program);
        std::process::exit(0);
    }

    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");

    let mut mode = None;
    let mut user_name = None;
    let mut log_level = LogLevel::default();

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--simulate" => mode = Some(Mode::Simulate),
            "--join" => mode = Some(Mode::Join),
            "--host" => match iter.next() {
                Some(room) => mode = Some(Mode::Host(room.clone())),
                None => {
                    eprintln!("--host 需要房间名");
                    std::process::exit(1);
                }
            },
            "--log-level" => match iter.next().map(|l| l.parse::<LogLevel>()) {
                Some(Ok(level)) => log_level = level,
                Some(Err(e)) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
                None => {
                    eprintln!("--log-level 需要级别");
                    std::process::exit(1);
                }
            },
            "--verbose" | "-v" => {}
            other if !other.starts_with('-') && user_name.is_none() => {
                user_name = Some(other.to_string());
            }
            other => {
                eprintln!("未知参数: {}", other);
                print_usage(&program);
                std::process::exit(1);
            }
        }
    }

    let (Some(user_name), Some(mode)) = (user_name, mode) else {
        print_usage(&program);
        std::process::exit(1);
    };

    (
        CliArgs {
            user_name,
            mode,
            log_level,
        },
        verbose,
    )
}

/// 用户名生成发送者 ID
fn sender_id(user_name: &str) -> String {
    user_name.to_lowercase().replace(char::is_whitespace, "-")
}

fn print_message(label: &str, message: &ChatMessage) {
    let direction = if message.is_local { "→" } else { "←" };
    println!(
        "[{}] {} {}: {}",
        label, direction, message.sender_name, message.content
    );
}

fn describe_state(state: &ConnectionState) -> String {
    match state {
        ConnectionState::Disconnected => "🔌 未连接".to_string(),
        ConnectionState::Searching => "🔍 正在搜索房间...".to_string(),
        ConnectionState::Hosting(room) => format!("📡 正在主持房间: {}", room),
        ConnectionState::Connected(room) => format!("✅ 已连接房间: {}", room),
        ConnectionState::Error(message) => format!("❌ 连接错误: {}", message),
    }
}

/// 等待连接状态满足条件
async fn wait_for_state<F>(
    states: &mut watch::Receiver<ConnectionState>,
    limit: Duration,
    predicate: F,
) -> Option<ConnectionState>
where
    F: Fn(&ConnectionState) -> bool,
{
    let waited = tokio::time::timeout(limit, states.wait_for(|s| predicate(s))).await;
    match waited {
        Ok(Ok(state)) => Some((*state).clone()),
        _ => None,
    }
}

/// 打印一个会话的消息流和状态变化
fn spawn_printer(label: &'static str, session: &ChatSession) -> tokio::task::JoinHandle<()> {
    let mut messages = session.subscribe_messages();
    let mut states = session.connection_state();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = messages.recv() => match received {
                    Ok(message) => print_message(label, &message),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("[{}] 消息流落后，丢失 {} 条", label, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = states.borrow_and_update().clone();
                    println!("[{}] {}", label, describe_state(&state));
                }
            }
        }
    })
}

/// 运行模拟模式
///
/// 两台设备共享一个进程内网格，心跳调快以便几秒内看到静默断线的效果。
async fn run_simulation(user_name: String) -> Result<(), Box<dyn std::error::Error>> {
    println!("lchat 模拟模式");
    println!("========================================");

    let mesh = MemoryMesh::new();
    let host_device = mesh.device("host");
    let client_device = mesh.device("client");

    let config = SessionConfig::new().with_keep_alive(KeepAliveConfig::new(
        Duration::from_secs(1),
        Duration::from_secs(3),
    ));
    let liveness = LivenessConfig::new()
        .with_timeout(Duration::from_secs(3))
        .with_check_interval(Duration::from_millis(500));

    let host = ChatSession::new(
        Arc::new(host_device.clone()),
        config.clone(),
        Arc::new(MemoryMessageStore::new()),
    )
    .with_liveness(liveness.clone());
    let client = ChatSession::new(
        Arc::new(client_device.clone()),
        config,
        Arc::new(MemoryMessageStore::new()),
    )
    .with_liveness(liveness);

    let host_printer = spawn_printer("主机", &host);
    let client_printer = spawn_printer("客户端", &client);

    host.start_hosting("模拟房间").await?;
    client.start_discovering().await?;

    let mut client_states = client.connection_state();
    let connected = wait_for_state(&mut client_states, Duration::from_secs(10), |s| {
        matches!(s, ConnectionState::Connected(_))
    })
    .await;
    if connected.is_none() {
        println!("❌ 客户端没能连接到主机");
        host.stop().await;
        client.stop().await;
        return Ok(());
    }

    client
        .send_message(&sender_id(&user_name), &user_name, "你好，有人在吗？")
        .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    host.send_message("host", "主机", "欢迎来到模拟房间").await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!();
    println!("📴 模拟无线链路静默中断（数据报被丢弃，不会收到断开通知）...");
    host_device.set_partitioned(true);
    client_device.set_partitioned(true);

    let degraded = wait_for_state(&mut client_states, Duration::from_secs(15), |s| {
        *s == ConnectionState::Disconnected
    })
    .await;
    match degraded {
        Some(_) => println!("✓ 客户端检测到静默断线并回到未连接状态"),
        None => println!("⚠️ 客户端没有在预期时间内检测到断线"),
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    println!("主机剩余对端: {}", host.coordinator().peer_count().await);

    let history = client.history().await?;
    println!("客户端历史消息: {} 条", history.len());

    host.stop().await;
    client.stop().await;
    host_printer.abort();
    client_printer.abort();

    println!("模拟结束");
    Ok(())
}

/// 运行局域网模式：主持或加入房间，把标准输入的每一行作为聊天消息发送
async fn run_network(user_name: String, room: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let transport = P2pTransport::new(P2pConfig::new())?;
    println!("本地 Peer ID: {}", transport.local_peer_id());
    let transport: Arc<dyn DiscoveryTransport> = Arc::new(transport);

    let session = ChatSession::new(
        transport,
        SessionConfig::new(),
        Arc::new(MemoryMessageStore::new()),
    );
    let printer = spawn_printer("lchat", &session);

    match &room {
        Some(room) => session.start_hosting(room.clone()).await?,
        None => session.start_discovering().await?,
    }

    println!("输入消息后回车发送，输入 /quit 退出");
    let sender = sender_id(&user_name);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                if let Err(e) = session.send_message(&sender, &user_name, line).await {
                    println!("⚠️ 发送失败: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    println!("正在退出...");
    session.stop().await;
    printer.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (args, verbose) = parse_args();

    let _log_guard = LoggingConfig::new()
        .with_level(args.log_level)
        .with_console_output(verbose)
        .init()?;
    tracing::info!("lchat 启动，用户: {}", args.user_name);

    match args.mode {
        Mode::Simulate => run_simulation(args.user_name).await,
        Mode::Host(room) => run_network(args.user_name, Some(room)).await,
        Mode::Join => run_network(args.user_name, None).await,
    }
}
