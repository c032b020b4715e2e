use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::UdpSocket;

use crate::config::AppSettings;
use crate::error::AppError;
use crate::switcher::SwitcherState;

const COMMAND_PREFIX: &str = "SWITCH ";
const MAX_DATAGRAM: usize = 1024;

/// `SWITCH <input> <output>`, by 1-based index or name.
pub fn parse_switch_command(
    message: &str,
    settings: &AppSettings,
) -> Result<(String, String), AppError> {
    let message = message.trim();
    let args = message
        .get(..COMMAND_PREFIX.len())
        .filter(|p| p.eq_ignore_ascii_case(COMMAND_PREFIX))
        .map(|_| message[COMMAND_PREFIX.len()..].trim())
        .ok_or_else(|| {
            AppError::InvalidValue("expected: SWITCH <input> <output>".into())
        })?;

    let sources = settings.sources();
    let outputs = settings.outputs();
    let tokens: Vec<&str> = args.split_whitespace().collect();

    let (input, output) = match tokens.as_slice() {
        [a, b] if a.parse::<usize>().is_ok() && b.parse::<usize>().is_ok() => {
            let by_index = |list: &[String], token: &str| {
                token
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| i.checked_sub(1))
                    .and_then(|i| list.get(i).cloned())
            };
            (by_index(&sources, *a), by_index(&outputs, *b))
        }
        _ => match find_matching_name(args, &sources) {
            Some(input) => {
                let rest = args[input.len()..].trim();
                let output = match find_matching_name(rest, &outputs) {
                    Some(output) => Some(output),
                    None => find_contained_name(rest, &outputs),
                };
                (Some(input), output)
            }
            None => (None, None),
        },
    };

    let input = input.ok_or_else(|| {
        AppError::InvalidValue(format!("could not parse input from '{message}'"))
    })?;
    let output = output.ok_or_else(|| {
        AppError::InvalidValue(format!("could not parse output from '{message}'"))
    })?;

    let route = settings
        .find_route(&input, &output)
        .ok_or_else(|| AppError::NotFoundRoute(format!("{input} -> {output}")))?;
    Ok((route.source_name.clone(), route.output_name.clone()))
}

/// Longest candidate that `text` starts with, ignoring case.
fn find_matching_name(text: &str, candidates: &[String]) -> Option<String> {
    candidates
        .iter()
        .filter(|c| {
            text.get(..c.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(c))
        })
        .max_by_key(|c| c.len())
        .cloned()
}

fn find_contained_name(text: &str, candidates: &[String]) -> Option<String> {
    let text = text.to_ascii_lowercase();
    candidates
        .iter()
        .find(|c| text.contains(&c.to_ascii_lowercase()))
        .cloned()
}

/// Receives commands until the socket fails to bind; per-datagram errors
/// are logged and skipped.
pub async fn run_udp_listener(port: u16, switcher: Arc<SwitcherState>) -> Result<(), AppError> {
    let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
    info!("UDP listener ready on port {port}");

    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                error!("error receiving UDP message: {e}");
                continue;
            }
        };
        let message = String::from_utf8_lossy(&buf[..len]);
        info!("UDP received from {peer}: {}", message.trim());

        let result = parse_switch_command(&message, &switcher.settings())
            .and_then(|(source, output)| {
                switcher.switch_route(&source, &output)?;
                Ok((source, output))
            });
        match result {
            Ok((source, output)) => info!("UDP switch executed: {source} -> {output}"),
            Err(e) => warn!("UDP command rejected: {e}"),
        }
    }
}
