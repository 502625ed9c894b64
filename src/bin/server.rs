//! HTTP server for the data quality engine UI
//! Simple HTTP server using tokio and basic HTTP handling

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use dq_engine::api::DqService;
use dq_engine::error::DqError;
use dq_engine::llm::LlmClient;
use dq_engine::rule_store::RuleStore;
use dq_engine::store::SqliteStore;

const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let bind_addr = std::env::var("DQ_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let source_db = std::env::var("DQ_SOURCE_DB").unwrap_or_else(|_| "data.db".to_string());
    let rules_db = std::env::var("DQ_RULES_DB").unwrap_or_else(|_| "rules.db".to_string());

    println!("🚀 Starting DQ Engine API Server...");
    println!("📡 Server will run on http://{}", bind_addr);
    println!("🗄️  Source database: {}", source_db);
    println!("📏 Rule database: {}", rules_db);

    // Check if API key is set
    if std::env::var("OPENAI_API_KEY").is_ok() {
        println!("✅ OpenAI API key found - rule generation enabled");
    } else {
        println!("⚠️  OpenAI API key not found - model-backed endpoints will fail");
    }

    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_else(|_| "dummy".to_string());
    let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
    let base_url = std::env::var("OPENAI_BASE_URL")
        .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    let llm = Arc::new(LlmClient::new(api_key, model, base_url));

    let store = Arc::new(SqliteStore::open(&source_db)?);
    let rules = RuleStore::open(&rules_db)?;
    let service = Arc::new(DqService::new(store, rules, llm));

    let listener = TcpListener::bind(&bind_addr).await?;
    println!("✅ Server listening on {}", bind_addr);

    loop {
        let (stream, addr) = listener.accept().await?;
        eprintln!("📥 New connection from: {}", addr);
        tokio::spawn(handle_connection(stream, service.clone()));
    }
}

async fn handle_connection(mut stream: TcpStream, service: Arc<DqService>) {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    // Read until the headers plus the Content-Length body have arrived.
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(size) => {
                buffer.extend_from_slice(&chunk[..size]);
                if request_complete(&buffer) || buffer.len() > MAX_REQUEST_BYTES {
                    break;
                }
            }
            Err(e) => {
                eprintln!("Failed to read from stream: {}", e);
                return;
            }
        }
    }

    let request = String::from_utf8_lossy(&buffer);
    let response = handle_request(&request, &service).await;

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        eprintln!("Failed to write response: {}", e);
    }
}

fn request_complete(buffer: &[u8]) -> bool {
    let text = String::from_utf8_lossy(buffer);
    let header_end = match text.find("\r\n\r\n") {
        Some(pos) => pos,
        None => return false,
    };
    let content_length = text
        .lines()
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);
    buffer.len() >= header_end + 4 + content_length
}

async fn handle_request(request: &str, service: &DqService) -> String {
    let lines: Vec<&str> = request.lines().collect();
    if lines.is_empty() {
        return create_response(400, "Bad Request", "{}");
    }

    let request_line = lines[0];
    let parts: Vec<&str> = request_line.split_whitespace().collect();

    if parts.len() < 2 {
        return create_response(400, "Bad Request", "{}");
    }

    let method = parts[0];
    let mut path_str = parts[1].to_string();

    // Remove query parameters if present
    if let Some(query_start) = path_str.find('?') {
        path_str = path_str[..query_start].to_string();
    }

    // Normalize path (remove trailing slash except for root)
    path_str = path_str.trim_end_matches('/').to_string();
    if path_str.is_empty() {
        path_str = "/".to_string();
    }
    let path = path_str.as_str();

    // Debug logging
    eprintln!("🔍 Request: {} {}", method, path);

    // Parse headers
    let mut headers = HashMap::new();
    for line in &lines[1..] {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let body = request_body(request);

    // Handle routes
    match (method, path) {
        ("GET", "/api/health") => {
            create_response(200, "OK", r#"{"status":"ok","service":"dq-engine-api"}"#)
        }
        ("GET", "/api/tables") => match service.list_tables().await {
            Ok(tables) => json_response(&serde_json::json!({ "tables": tables })),
            Err(e) => error_response(&e),
        },
        ("POST", "/api/schema") => {
            let table_name = match body_str(&body, "table_name") {
                Some(t) => t,
                None => return missing_field("table_name"),
            };
            match service.table_schema(table_name).await {
                Ok(schema) => json_response(&serde_json::json!({
                    "table_name": table_name,
                    "schema": schema,
                })),
                Err(e) => error_response(&e),
            }
        }
        ("POST", "/api/sample") => {
            let table_name = match body_str(&body, "table_name") {
                Some(t) => t,
                None => return missing_field("table_name"),
            };
            let column_name = match body_str(&body, "column_name") {
                Some(c) => c,
                None => return missing_field("column_name"),
            };
            let limit = body_usize(&body, "limit", 20);
            match service.sample_values(table_name, column_name, limit).await {
                Ok(sample) => {
                    let values: Vec<serde_json::Value> = sample
                        .values
                        .iter()
                        .map(|(value, count)| {
                            serde_json::json!({ "value": value, "count": count })
                        })
                        .collect();
                    json_response(&serde_json::json!({
                        "column_name": sample.column,
                        "values": values,
                    }))
                }
                Err(e) => error_response(&e),
            }
        }
        ("POST", "/api/rules/convert") => {
            let rule = match body_str(&body, "rule") {
                Some(r) => r,
                None => return missing_field("rule"),
            };
            let table_name = match body_str(&body, "table_name") {
                Some(t) => t,
                None => return missing_field("table_name"),
            };
            let column_name = match body_str(&body, "column_name") {
                Some(c) => c,
                None => return missing_field("column_name"),
            };
            match service.convert_rule(rule, table_name, column_name).await {
                Ok(conversion) => json_response(&conversion),
                Err(e) => error_response(&e),
            }
        }
        ("POST", "/api/rules/add") => {
            let rule = match body_str(&body, "rule") {
                Some(r) => r,
                None => return missing_field("rule"),
            };
            let table_name = match body_str(&body, "table_name") {
                Some(t) => t,
                None => return missing_field("table_name"),
            };
            let column_name = match body_str(&body, "column_name") {
                Some(c) => c,
                None => return missing_field("column_name"),
            };
            let sql_query = match body_str(&body, "sql_query") {
                Some(q) => q,
                None => return missing_field("sql_query"),
            };
            let rule_category = body_str(&body, "rule_category").unwrap_or("general");
            match service
                .add_rule(rule, table_name, column_name, rule_category, sql_query)
                .await
            {
                Ok(record) => json_response(&record),
                Err(e) => error_response(&e),
            }
        }
        ("POST", "/api/rules/delete") => {
            let rule_id = match body_str(&body, "rule_id") {
                Some(id) => id,
                None => return missing_field("rule_id"),
            };
            match service.delete_rule(rule_id).await {
                Ok(removed) => json_response(&serde_json::json!({ "removed": removed })),
                Err(e) => error_response(&e),
            }
        }
        ("POST", "/api/rules/list") => {
            let table_name = match body_str(&body, "table_name") {
                Some(t) => t,
                None => return missing_field("table_name"),
            };
            match service.rules_of_table(table_name).await {
                Ok(records) => json_response(&serde_json::json!({ "rules": records })),
                Err(e) => error_response(&e),
            }
        }
        ("POST", "/api/rules/suggest") => {
            let table_name = match body_str(&body, "table_name") {
                Some(t) => t,
                None => return missing_field("table_name"),
            };
            let column_name = match body_str(&body, "column_name") {
                Some(c) => c,
                None => return missing_field("column_name"),
            };
            let extra_rules = body_string_array(&body, "existing_rules");
            match service
                .suggest_rule(table_name, column_name, &extra_rules)
                .await
            {
                Ok(suggestion) => {
                    json_response(&serde_json::json!({ "suggestion": suggestion }))
                }
                Err(e) => error_response(&e),
            }
        }
        ("POST", "/api/validate") => {
            let sql_query = match body_str(&body, "sql_query") {
                Some(q) => q,
                None => return missing_field("sql_query"),
            };
            let table_name = match body_str(&body, "table_name") {
                Some(t) => t,
                None => return missing_field("table_name"),
            };
            let column_name = match body_str(&body, "column_name") {
                Some(c) => c,
                None => return missing_field("column_name"),
            };
            match service.validate_query(sql_query, table_name, column_name).await {
                Ok(report) => json_response(&report),
                Err(e) => error_response(&e),
            }
        }
        ("POST", "/api/browse/table") => {
            let table_name = match body_str(&body, "table_name") {
                Some(t) => t,
                None => return missing_field("table_name"),
            };
            let limit = body_usize(&body, "limit", 100);
            let offset = body_usize(&body, "offset", 0);
            match service.browse_table(table_name, limit, offset).await {
                Ok(rows) => json_response(&rows),
                Err(e) => error_response(&e),
            }
        }
        ("POST", "/api/browse/column") => {
            let table_name = match body_str(&body, "table_name") {
                Some(t) => t,
                None => return missing_field("table_name"),
            };
            let column_name = match body_str(&body, "column_name") {
                Some(c) => c,
                None => return missing_field("column_name"),
            };
            let limit = body_usize(&body, "limit", 100);
            let offset = body_usize(&body, "offset", 0);
            match service
                .browse_column(table_name, column_name, limit, offset)
                .await
            {
                Ok(rows) => json_response(&rows),
                Err(e) => error_response(&e),
            }
        }
        ("POST", "/api/chat") => {
            let message = match body_str(&body, "message") {
                Some(m) => m,
                None => return missing_field("message"),
            };
            let table_name = match body_str(&body, "table_name") {
                Some(t) => t,
                None => return missing_field("table_name"),
            };
            let column_name = match body_str(&body, "column_name") {
                Some(c) => c,
                None => return missing_field("column_name"),
            };
            let thread_id = body_str(&body, "thread_id");
            match service.chat(message, table_name, column_name, thread_id).await {
                Ok(reply) => json_response(&serde_json::json!({
                    "thread_id": reply.thread_id,
                    "answer": reply.answer,
                })),
                Err(e) => error_response(&e),
            }
        }
        ("POST", "/api/chat/extract-rule") => {
            let response_text = match body_str(&body, "response_text") {
                Some(t) => t,
                None => return missing_field("response_text"),
            };
            match service.extract_rule(response_text).await {
                Ok(rule) => json_response(&serde_json::json!({ "rule": rule })),
                Err(e) => error_response(&e),
            }
        }
        ("OPTIONS", _) => {
            // Handle CORS preflight
            create_response(200, "OK", "")
        }
        _ => {
            eprintln!("❌ 404: {} {} not found", method, path);
            create_response(
                404,
                "Not Found",
                &format!(r#"{{"error":"Endpoint not found: {} {}"}}"#, method, path),
            )
        }
    }
}

fn request_body(request: &str) -> serde_json::Value {
    let body_start = request.find("\r\n\r\n").unwrap_or(request.len());
    let body = request[body_start..].trim();
    if let Some(json_start) = body.find('{') {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(&body[json_start..]) {
            return json;
        }
    }
    serde_json::Value::Null
}

fn body_str<'a>(body: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    body.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn body_usize(body: &serde_json::Value, key: &str, default: usize) -> usize {
    body.get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(default)
}

fn body_string_array(body: &serde_json::Value, key: &str) -> Vec<String> {
    body.get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn missing_field(name: &str) -> String {
    create_response(
        400,
        "Bad Request",
        &format!(r#"{{"error":"{} is required"}}"#, name),
    )
}

fn json_response<T: serde::Serialize>(value: &T) -> String {
    let body = serde_json::to_string(value)
        .unwrap_or_else(|_| r#"{"error":"Failed to serialize response"}"#.to_string());
    create_response(200, "OK", &body)
}

fn error_response(err: &DqError) -> String {
    let (status, status_text) = match err {
        DqError::UnknownTable(_) | DqError::UnknownColumn { .. } => (404, "Not Found"),
        DqError::UnsafeQuery(_) => (400, "Bad Request"),
        _ => (500, "Internal Server Error"),
    };
    eprintln!("❌ {} {}: {}", status, status_text, err);
    let body = serde_json::json!({ "error": err.to_string() });
    create_response(status, status_text, &body.to_string())
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, PUT, DELETE, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}
