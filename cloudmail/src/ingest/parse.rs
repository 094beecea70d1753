//! MIME parsing of fetched messages

use mail_parser::{Address, Message, MessageParser, MimeHeaders};

use crate::error::{CloudMailError, Result};

const PREVIEW_CHARS: usize = 100;

/// Header-only view of a message, enough to route it to accounts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub uid: u32,
    pub message_id: Option<String>,
    /// Lowercased To, Cc and Bcc addresses
    pub recipients: Vec<String>,
    /// Header date, else the server's internal date (Unix milliseconds)
    pub date: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ParsedAttachment {
    pub name: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub message_id: Option<String>,
    pub sender: Option<String>,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub preview: Option<String>,
    pub body: Option<String>,
    pub date: Option<i64>,
    pub attachments: Vec<ParsedAttachment>,
}

fn addresses<'a>(address: Option<&'a Address<'a>>) -> impl Iterator<Item = String> + 'a {
    address
        .into_iter()
        .flat_map(|a| a.iter())
        .filter_map(|addr| addr.address())
        .map(|a| a.trim().to_lowercase())
        .filter(|a| a.contains('@'))
}

fn recipients(message: &Message) -> Vec<String> {
    let mut all: Vec<String> = addresses(message.to())
        .chain(addresses(message.cc()))
        .chain(addresses(message.bcc()))
        .collect();
    all.sort();
    all.dedup();
    all
}

fn date_ms(message: &Message) -> Option<i64> {
    message.date().map(|d| d.to_timestamp() * 1000)
}

/// Parse a header block fetched with `BODY.PEEK[HEADER]`.
pub fn parse_envelope(uid: u32, header: &[u8], internal_date: Option<i64>) -> Envelope {
    match MessageParser::default().parse(header) {
        Some(message) => Envelope {
            uid,
            message_id: message.message_id().map(|id| id.to_string()),
            recipients: recipients(&message),
            date: date_ms(&message).or(internal_date),
        },
        None => Envelope {
            uid,
            message_id: None,
            recipients: Vec::new(),
            date: internal_date,
        },
    }
}

/// Parse a full RFC 5322 message.
pub fn parse_message(raw: &[u8]) -> Result<ParsedMessage> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| CloudMailError::Parse("failed to parse email message".to_string()))?;

    let from = message.from().and_then(|a| a.first());
    let text = message.body_text(0);

    let preview = text
        .as_deref()
        .map(|t| t.chars().take(PREVIEW_CHARS).collect::<String>())
        .filter(|p| !p.is_empty());

    // body_html renders a text-only message as HTML
    let body = message
        .body_html(0)
        .map(|b| b.into_owned())
        .or_else(|| text.as_ref().map(|t| t.to_string()));

    let attachments = message
        .attachments()
        .map(|part| {
            let mime_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            ParsedAttachment {
                name: part
                    .attachment_name()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or("attachment")
                    .to_string(),
                mime_type,
                content: part.contents().to_vec(),
            }
        })
        .collect();

    Ok(ParsedMessage {
        message_id: message.message_id().map(|id| id.to_string()),
        sender: from.and_then(|a| a.address()).map(|a| a.to_lowercase()),
        sender_name: from.and_then(|a| a.name()).map(|n| n.to_string()),
        subject: message.subject().map(|s| s.to_string()),
        preview,
        body,
        date: date_ms(&message),
        attachments,
    })
}
