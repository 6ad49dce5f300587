use super::ProbeResult;
use reqwest::Url;
use rusqlite::{Connection, OpenFlags};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Postgres `SSLRequest` message: length 8, code 80877103.
const PG_SSL_REQUEST: [u8; 8] = [0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f];
const MYSQL_PROTOCOL_V10: u8 = 10;
const MYSQL_ERR_PACKET: u8 = 0xff;

/// Probe a database by connection string. The scheme picks the wire check.
pub(super) async fn probe_database(target: &str, started: Instant) -> ProbeResult {
    let target = target.trim();
    if let Some(path) = sqlite_path(target) {
        return probe_sqlite(path.to_string(), started).await;
    }

    let url = match Url::parse(target) {
        Ok(url) => url,
        Err(e) => return ProbeResult::offline(started, format!("Invalid connection string: {}", e)),
    };
    let host = match url.host_str() {
        Some(h) => h.trim_start_matches('[').trim_end_matches(']').to_string(),
        None => return ProbeResult::offline(started, "Connection string has no host"),
    };

    match url.scheme() {
        "postgres" | "postgresql" => {
            let stream = match connect(&host, url.port().unwrap_or(5432), started).await {
                Ok(s) => s,
                Err(result) => return result,
            };
            probe_postgres(stream, started).await
        }
        "mysql" | "mariadb" => {
            let stream = match connect(&host, url.port().unwrap_or(3306), started).await {
                Ok(s) => s,
                Err(result) => return result,
            };
            probe_mysql(stream, started).await
        }
        "redis" | "rediss" => {
            let stream = match connect(&host, url.port().unwrap_or(6379), started).await {
                Ok(s) => s,
                Err(result) => return result,
            };
            let password = url.password().map(String::from);
            let username = Some(url.username()).filter(|u| !u.is_empty()).map(String::from);
            probe_redis(stream, username, password, started).await
        }
        "mongodb" | "mongodb+srv" => match connect(&host, url.port().unwrap_or(27017), started).await {
            Ok(_) => ProbeResult::online(started, format!("Connected to MongoDB at {}", host)),
            Err(result) => result,
        },
        other => ProbeResult::offline(started, format!("Unsupported database scheme '{}'", other)),
    }
}

const SCHEMES: &[&str] = &["postgres", "postgresql", "mysql", "mariadb", "redis", "rediss", "mongodb", "mongodb+srv"];

/// Connection strings that can never be probed, as opposed to ones that fail.
pub(super) fn config_problem(target: &str) -> Option<String> {
    let target = target.trim();
    if sqlite_path(target).is_some() {
        return None;
    }
    match Url::parse(target) {
        Err(e) => Some(format!("Invalid connection string: {}", e)),
        Ok(url) if !SCHEMES.contains(&url.scheme()) => {
            Some(format!("Unsupported database scheme '{}'", url.scheme()))
        }
        Ok(url) if url.host_str().is_none() => Some("Connection string has no host".to_string()),
        Ok(_) => None,
    }
}

fn sqlite_path(target: &str) -> Option<&str> {
    target
        .strip_prefix("sqlite://")
        .or_else(|| target.strip_prefix("sqlite:"))
}

async fn connect(host: &str, port: u16, started: Instant) -> Result<TcpStream, ProbeResult> {
    TcpStream::connect((host, port))
        .await
        .map_err(|e| ProbeResult::offline(started, format!("Connection to {}:{} failed: {}", host, port, e)))
}

async fn probe_postgres(mut stream: TcpStream, started: Instant) -> ProbeResult {
    if let Err(e) = stream.write_all(&PG_SSL_REQUEST).await {
        return ProbeResult::offline(started, format!("PostgreSQL write failed: {}", e));
    }
    let mut reply = [0u8; 1];
    match stream.read_exact(&mut reply).await {
        Ok(_) if reply[0] == b'S' || reply[0] == b'N' => {
            ProbeResult::online(started, "PostgreSQL accepted connection")
        }
        Ok(_) => ProbeResult::degraded(
            started,
            format!("PostgreSQL sent unexpected reply 0x{:02x}", reply[0]),
        ),
        Err(e) => ProbeResult::offline(started, format!("PostgreSQL closed connection: {}", e)),
    }
}

async fn probe_mysql(mut stream: TcpStream, started: Instant) -> ProbeResult {
    let mut header = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut header).await {
        return ProbeResult::offline(started, format!("MySQL sent no greeting: {}", e));
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let mut payload = vec![0u8; len.min(1024)];
    if let Err(e) = stream.read_exact(&mut payload).await {
        return ProbeResult::offline(started, format!("MySQL greeting truncated: {}", e));
    }

    match payload.first() {
        Some(&MYSQL_PROTOCOL_V10) => ProbeResult::online(started, "MySQL protocol v10 greeting"),
        Some(&MYSQL_ERR_PACKET) => {
            // 0xff, 2-byte error code, then the message
            let message = payload.get(3..).map(String::from_utf8_lossy).unwrap_or_default();
            ProbeResult::offline(started, format!("MySQL refused connection: {}", message))
        }
        Some(other) => ProbeResult::degraded(started, format!("MySQL sent unknown protocol {}", other)),
        None => ProbeResult::offline(started, "MySQL sent an empty greeting"),
    }
}

async fn probe_redis(
    stream: TcpStream,
    username: Option<String>,
    password: Option<String>,
    started: Instant,
) -> ProbeResult {
    let mut stream = BufReader::new(stream);

    if let Some(password) = password {
        let mut args = vec!["AUTH"];
        if let Some(user) = username.as_deref() {
            args.push(user);
        }
        args.push(&password);
        match redis_command(&mut stream, &args).await {
            Ok(reply) if reply.starts_with('+') => {}
            Ok(reply) => {
                return ProbeResult::degraded(started, format!("Redis reachable but rejected AUTH: {}", reply))
            }
            Err(e) => return ProbeResult::offline(started, format!("Redis AUTH failed: {}", e)),
        }
    }

    match redis_command(&mut stream, &["PING"]).await {
        Ok(reply) if reply == "+PONG" => ProbeResult::online(started, "Redis PONG"),
        Ok(reply) if is_auth_error(&reply) => {
            ProbeResult::degraded(started, format!("Redis reachable but requires auth: {}", reply))
        }
        Ok(reply) => ProbeResult::degraded(started, format!("Redis replied {}", reply)),
        Err(e) => ProbeResult::offline(started, format!("Redis PING failed: {}", e)),
    }
}

fn is_auth_error(reply: &str) -> bool {
    reply.starts_with("-NOAUTH") || reply.starts_with("-WRONGPASS") || reply.contains("auth")
}

async fn redis_command(stream: &mut BufReader<TcpStream>, args: &[&str]) -> std::io::Result<String> {
    stream.get_mut().write_all(&encode_resp(args)).await?;
    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed"));
    }
    Ok(line.trim_end().to_string())
}

/// RESP array of bulk strings.
fn encode_resp(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

async fn probe_sqlite(path: String, started: Instant) -> ProbeResult {
    let check = tokio::task::spawn_blocking(move || -> rusqlite::Result<i64> {
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.query_row("SELECT 1", [], |row| row.get(0))
    })
    .await;

    match check {
        Ok(Ok(_)) => ProbeResult::online(started, "SQLite SELECT 1 succeeded"),
        Ok(Err(e)) => ProbeResult::offline(started, format!("SQLite check failed: {}", e)),
        Err(e) => ProbeResult::offline(started, format!("SQLite check aborted: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeOutcome;
    use tokio::net::TcpListener;

    async fn reply_server(reply: &'static [u8], read_first: bool) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                if read_first {
                    let mut buf = [0u8; 256];
                    let _ = socket.read(&mut buf).await;
                }
                let _ = socket.write_all(reply).await;
            }
        });
        port
    }

    #[test]
    fn test_encode_resp() {
        assert_eq!(encode_resp(&["PING"]), b"*1\r\n$4\r\nPING\r\n".to_vec());
    }

    #[tokio::test]
    async fn test_postgres_ssl_reply_is_online() {
        let port = reply_server(b"N", true).await;
        let result = probe_database(&format!("postgres://u:p@127.0.0.1:{}/app", port), Instant::now()).await;
        assert!(matches!(result.outcome, ProbeOutcome::Online { .. }), "{:?}", result);
    }

    #[tokio::test]
    async fn test_redis_pong_is_online() {
        let port = reply_server(b"+PONG\r\n", true).await;
        let result = probe_database(&format!("redis://127.0.0.1:{}", port), Instant::now()).await;
        assert!(matches!(result.outcome, ProbeOutcome::Online { .. }), "{:?}", result);
    }

    #[tokio::test]
    async fn test_redis_noauth_is_degraded() {
        let port = reply_server(b"-NOAUTH Authentication required.\r\n", true).await;
        let result = probe_database(&format!("redis://127.0.0.1:{}", port), Instant::now()).await;
        assert!(matches!(result.outcome, ProbeOutcome::Degraded { .. }), "{:?}", result);
    }

    #[tokio::test]
    async fn test_mysql_greeting() {
        // 4-byte header (len 5, seq 0), protocol 10, then version text
        let port = reply_server(&[5, 0, 0, 0, 10, b'8', b'.', b'0', 0], false).await;
        let result = probe_database(&format!("mysql://127.0.0.1:{}/app", port), Instant::now()).await;
        assert!(matches!(result.outcome, ProbeOutcome::Online { .. }), "{:?}", result);
    }

    #[test]
    fn test_config_problems() {
        assert!(config_problem("postgres://db.internal/app").is_none());
        assert!(config_problem("sqlite:///var/lib/app.db").is_none());
        assert!(config_problem("oracle://db.internal:1521/x").unwrap().contains("Unsupported"));
        assert!(config_problem("not a url").unwrap().contains("Invalid"));
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_offline() {
        let result = probe_database("oracle://db.internal:1521/x", Instant::now()).await;
        assert!(result.outcome.detail().contains("Unsupported"));
    }

    #[tokio::test]
    async fn test_sqlite_file() {
        let path = std::env::temp_dir().join(format!("fleetwatch-probe-{}.db", uuid::Uuid::new_v4()));
        Connection::open(&path).unwrap().execute_batch("CREATE TABLE t (x INTEGER);").unwrap();
        let result = probe_database(&format!("sqlite://{}", path.display()), Instant::now()).await;
        assert!(matches!(result.outcome, ProbeOutcome::Online { .. }), "{:?}", result);
        let _ = std::fs::remove_file(&path);

        let missing = probe_database("sqlite:///nonexistent/dir/x.db", Instant::now()).await;
        assert!(matches!(missing.outcome, ProbeOutcome::Offline { .. }));
    }
}
