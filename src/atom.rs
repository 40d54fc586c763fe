// Atom push-notification parsing and hub signature verification.
use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use sha1::Sha1;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;

/// One upload notice extracted from a hub delivery. The hub posts a feed
/// document with a single `entry` carrying `yt:videoId` / `yt:channelId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadNotice {
    pub video_id: String,
    pub channel_id: String,
    pub title: Option<String>,
}

pub fn parse_notification(xml: &str) -> Result<UploadNotice> {
    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(true);
    let mut buffer = Vec::new();
    let mut current_tag: Option<String> = None;
    let mut in_entry = false;
    let mut video_id: Option<String> = None;
    let mut channel_id: Option<String> = None;
    let mut title: Option<String> = None;
    loop {
        match reader.read_event_into(&mut buffer) {
            Ok(Event::Start(event)) => {
                let local = String::from_utf8_lossy(event.local_name().as_ref()).to_string();
                if local == "entry" {
                    in_entry = true;
                }
                current_tag = Some(local);
            }
            Ok(Event::Text(event)) => {
                if let Some(tag) = current_tag.take() {
                    let text = event
                        .unescape()
                        .map_err(|_| anyhow!("notification text decode failed"))?
                        .trim()
                        .to_string();
                    if text.is_empty() {
                        continue;
                    }
                    match tag.as_str() {
                        "videoId" if video_id.is_none() => video_id = Some(text),
                        "channelId" if channel_id.is_none() => channel_id = Some(text),
                        // The feed itself carries a title before the entry does.
                        "title" if in_entry && title.is_none() => title = Some(text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(event)) => {
                if event.local_name().as_ref() == b"entry" {
                    in_entry = false;
                }
                current_tag = None;
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(anyhow!("notification xml parse failed: {err}")),
            _ => {}
        }
        buffer.clear();
    }
    let video_id = video_id.ok_or_else(|| anyhow!("notification missing video id"))?;
    let channel_id = channel_id.ok_or_else(|| anyhow!("notification missing channel id"))?;
    Ok(UploadNotice {
        video_id,
        channel_id,
        title,
    })
}

/// Checks an `X-Hub-Signature: sha1=<hex>` header against the raw body.
pub fn verify_hub_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let header = header.trim();
    let Some(expected_hex) = header
        .strip_prefix("sha1=")
        .or_else(|| header.strip_prefix("SHA1="))
    else {
        return false;
    };
    let Ok(expected) = hex::decode(expected_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    if digest.len() != expected.len() {
        return false;
    }
    digest.as_slice().ct_eq(expected.as_slice()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTIFICATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015" xmlns="http://www.w3.org/2005/Atom">
  <title>YouTube video feed</title>
  <entry>
    <id>yt:video:VID1</id>
    <yt:videoId>VID1</yt:videoId>
    <yt:channelId>CH1</yt:channelId>
    <title>Hello</title>
    <published>2024-05-01T12:00:00Z</published>
  </entry>
</feed>"#;

    #[test]
    fn parses_upload_notice() {
        let notice = parse_notification(NOTIFICATION).unwrap();
        assert_eq!(notice.video_id, "VID1");
        assert_eq!(notice.channel_id, "CH1");
        assert_eq!(notice.title.as_deref(), Some("Hello"));
    }

    #[test]
    fn feed_title_is_not_the_entry_title() {
        let xml = r#"<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015">
            <title>feed level</title>
            <entry><yt:videoId>V</yt:videoId><yt:channelId>C</yt:channelId></entry>
        </feed>"#;
        let notice = parse_notification(xml).unwrap();
        assert_eq!(notice.title, None);
    }

    #[test]
    fn missing_ids_are_rejected() {
        let xml = "<feed><entry><title>no ids</title></entry></feed>";
        assert!(parse_notification(xml).is_err());
        assert!(parse_notification("<not-xml").is_err());
    }

    #[test]
    fn hub_signature_round_trip() {
        let body = b"payload bytes";
        let mut mac = HmacSha1::new_from_slice(b"hub-secret").unwrap();
        mac.update(body);
        let header = format!("sha1={}", hex::encode(mac.finalize().into_bytes()));
        assert!(verify_hub_signature("hub-secret", body, &header));
        assert!(!verify_hub_signature("other-secret", body, &header));
        assert!(!verify_hub_signature("hub-secret", b"other body", &header));
        assert!(!verify_hub_signature("hub-secret", body, "sha256=abcd"));
        assert!(!verify_hub_signature("hub-secret", body, "sha1=zzzz"));
    }
}
