use crate::bots::adapter::BotAdapter;
use crate::bots::types::{
    non_empty, resolve_api_base, AdapterConfig, ParsedMessage, Platform, RichMessage,
    WeComConfig, WebhookRequest,
};
use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use aes::Aes256;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use reqwest::Client;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::collections::HashMap;

type Aes256CbcDec = cbc::Decryptor<Aes256>;

const DEFAULT_DOMAIN: &str = "qyapi.weixin.qq.com";
const WECOM_PAD_BLOCK: usize = 32;

pub struct WeComAdapter {
    http: Client,
    config: WeComConfig,
}

impl WeComAdapter {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            config: WeComConfig::default(),
        }
    }

    fn signature_parts<'a>(
        &self,
        request: &WebhookRequest<'a>,
    ) -> Option<(&'a str, &'a str, &'a str)> {
        let signature = request
            .query_param("msg_signature")
            .or_else(|| request.header("x-wecom-signature"))?;
        let timestamp = request
            .query_param("timestamp")
            .or_else(|| request.header("x-wecom-timestamp"))?;
        let nonce = request
            .query_param("nonce")
            .or_else(|| request.header("x-wecom-nonce"))?;
        Some((signature, timestamp, nonce))
    }

    fn signed_ciphertext(&self, request: &WebhookRequest<'_>) -> Option<String> {
        if let Some(echostr) = request.query_param("echostr") {
            return Some(echostr.to_string());
        }
        let fields = parse_xml_fields(&request.body_text()).ok()?;
        fields.get("Encrypt").cloned()
    }

    fn check_signature(&self, request: &WebhookRequest<'_>) -> bool {
        let Some(token) = non_empty(self.config.token.as_ref()) else {
            return false;
        };
        let Some((signature, timestamp, nonce)) = self.signature_parts(request) else {
            return false;
        };
        let Some(encrypted) = self.signed_ciphertext(request) else {
            return false;
        };
        verify_signature(token, timestamp, nonce, &encrypted, signature)
    }

    fn decrypt(&self, encrypted: &str) -> Result<String> {
        let aes_key = non_empty(self.config.encoding_aes_key.as_ref())
            .ok_or_else(|| anyhow!("wecom encoding_aes_key missing"))?;
        decrypt_payload(encrypted, aes_key, non_empty(self.config.corp_id.as_ref()))
    }

    async fn post_message(&self, external_user_id: &str, mut payload: Value) -> Result<()> {
        let peer_id = external_user_id.trim();
        if peer_id.is_empty() {
            return Err(anyhow!("wecom outbound user id missing"));
        }
        let agent_id = non_empty(self.config.agent_id.as_ref())
            .ok_or_else(|| anyhow!("wecom agent_id missing"))?;
        if let Some(map) = payload.as_object_mut() {
            map.insert("touser".to_string(), Value::String(peer_id.to_string()));
            map.insert("agentid".to_string(), Value::String(agent_id.to_string()));
            map.insert("safe".to_string(), json!(0));
        }
        let access_token = self.fetch_access_token().await?;
        let base_url = resolve_api_base(self.config.domain.as_ref(), DEFAULT_DOMAIN);
        let response = self
            .http
            .post(format!("{base_url}/cgi-bin/message/send"))
            .query(&[("access_token", access_token.as_str())])
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("wecom outbound failed: {status} {body}"));
        }
        let body: Value = response.json().await?;
        let errcode = body.get("errcode").and_then(Value::as_i64).unwrap_or(-1);
        if errcode != 0 {
            let errmsg = body
                .get("errmsg")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(anyhow!("wecom outbound failed: {errmsg}"));
        }
        Ok(())
    }

    async fn fetch_access_token(&self) -> Result<String> {
        let corp_id = non_empty(self.config.corp_id.as_ref())
            .ok_or_else(|| anyhow!("wecom corp_id missing"))?;
        let secret = non_empty(self.config.secret.as_ref())
            .ok_or_else(|| anyhow!("wecom secret missing"))?;
        let base_url = resolve_api_base(self.config.domain.as_ref(), DEFAULT_DOMAIN);
        let response = self
            .http
            .get(format!("{base_url}/cgi-bin/gettoken"))
            .query(&[("corpid", corp_id), ("corpsecret", secret)])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("wecom token request failed: {status} {body}"));
        }
        let body: Value = response.json().await?;
        let errcode = body.get("errcode").and_then(Value::as_i64).unwrap_or(-1);
        if errcode != 0 {
            let errmsg = body
                .get("errmsg")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(anyhow!("wecom token request failed: {errmsg}"));
        }
        body.get("access_token")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("wecom token missing access_token"))
    }
}

#[async_trait]
impl BotAdapter for WeComAdapter {
    fn platform(&self) -> Platform {
        Platform::WeCom
    }

    async fn init(&mut self, config: &AdapterConfig) -> Result<()> {
        let AdapterConfig::WeCom(config) = config else {
            return Err(anyhow!(
                "wecom adapter cannot use {} config",
                config.platform()
            ));
        };
        if non_empty(config.token.as_ref()).is_none() {
            return Err(anyhow!("wecom token missing"));
        }
        if let Some(key) = non_empty(config.encoding_aes_key.as_ref()) {
            decode_encoding_aes_key(key)?;
        }
        self.config = config.clone();
        Ok(())
    }

    fn verify_signature(&self, request: &WebhookRequest<'_>) -> bool {
        self.check_signature(request)
    }

    /// URL 校验：验签后解密 `echostr` 并回显。
    fn handle_challenge(&self, request: &WebhookRequest<'_>) -> Option<String> {
        let echostr = request.query_param("echostr")?;
        if !self.check_signature(request) {
            return None;
        }
        self.decrypt(echostr).ok()
    }

    fn parse_message(&self, request: &WebhookRequest<'_>) -> Result<Option<ParsedMessage>> {
        let envelope = parse_xml_fields(&request.body_text())?;
        let xml = match envelope.get("Encrypt") {
            Some(encrypted) => self.decrypt(encrypted)?,
            None => request.body_text(),
        };
        extract_inbound_message(&xml)
    }

    async fn send_reply(&self, external_user_id: &str, text: &str) -> Result<()> {
        let text = if text.trim().is_empty() {
            "(empty message)"
        } else {
            text
        };
        self.post_message(
            external_user_id,
            json!({ "msgtype": "text", "text": { "content": text } }),
        )
        .await
    }

    async fn send_rich_message(&self, external_user_id: &str, message: &RichMessage) -> Result<()> {
        self.post_message(
            external_user_id,
            json!({ "msgtype": "markdown", "markdown": { "content": message.to_markdown() } }),
        )
        .await
    }
}

pub fn verify_signature(
    token: &str,
    timestamp: &str,
    nonce: &str,
    encrypted: &str,
    signature: &str,
) -> bool {
    let token = token.trim();
    let timestamp = timestamp.trim();
    let nonce = nonce.trim();
    let encrypted = encrypted.trim();
    let signature = signature.trim();
    if token.is_empty()
        || timestamp.is_empty()
        || nonce.is_empty()
        || encrypted.is_empty()
        || signature.is_empty()
    {
        return false;
    }
    let mut parts = [token, timestamp, nonce, encrypted];
    parts.sort_unstable();
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    digest.eq_ignore_ascii_case(signature)
}

pub fn decrypt_payload(
    encrypted: &str,
    encoding_aes_key: &str,
    expected_receive_id: Option<&str>,
) -> Result<String> {
    let key = decode_encoding_aes_key(encoding_aes_key)?;
    let encrypted = encrypted.trim();
    if encrypted.is_empty() {
        return Err(anyhow!("wecom encrypted payload is empty"));
    }
    let mut cipher_text = base64::engine::general_purpose::STANDARD
        .decode(encrypted)
        .map_err(|_| anyhow!("wecom encrypted payload is not valid base64"))?;
    if cipher_text.is_empty() {
        return Err(anyhow!("wecom encrypted payload is empty"));
    }

    let iv = &key[..16];
    let padded = Aes256CbcDec::new(key.as_slice().into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(&mut cipher_text)
        .map_err(|_| anyhow!("wecom payload decrypt failed"))?;
    // 企业微信按 32 字节块做 PKCS#7 填充，大于 AES 块长度。
    let pad = padded.last().copied().unwrap_or(0) as usize;
    if pad == 0 || pad > WECOM_PAD_BLOCK || pad > padded.len() {
        return Err(anyhow!("wecom payload padding invalid"));
    }
    let plain = &padded[..padded.len() - pad];
    if plain.len() < 20 {
        return Err(anyhow!("wecom payload is too short"));
    }
    let msg_len: [u8; 4] = plain[16..20]
        .try_into()
        .map_err(|_| anyhow!("wecom payload length parse failed"))?;
    let msg_len = u32::from_be_bytes(msg_len) as usize;
    let msg_start = 20;
    let msg_end = msg_start + msg_len;
    if msg_end > plain.len() {
        return Err(anyhow!("wecom payload length out of range"));
    }

    let receive_id = String::from_utf8_lossy(&plain[msg_end..])
        .trim()
        .to_string();
    if let Some(expected) = expected_receive_id
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        if !receive_id.is_empty() && !receive_id.eq_ignore_ascii_case(expected) {
            return Err(anyhow!("wecom payload receive_id mismatch"));
        }
    }

    String::from_utf8(plain[msg_start..msg_end].to_vec())
        .map_err(|_| anyhow!("wecom payload body is not utf-8"))
}

pub fn parse_xml_fields(xml: &str) -> Result<HashMap<String, String>> {
    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(true);
    let mut buffer = Vec::new();
    let mut current_tag: Option<String> = None;
    let mut output = HashMap::new();

    loop {
        match reader.read_event_into(&mut buffer) {
            Ok(Event::Start(event)) => {
                current_tag =
                    Some(String::from_utf8_lossy(event.local_name().as_ref()).to_string());
            }
            Ok(Event::Text(event)) => {
                if let Some(tag) = current_tag.take() {
                    let text = event
                        .unescape()
                        .map_err(|_| anyhow!("wecom xml text decode failed"))?
                        .trim()
                        .to_string();
                    if !text.is_empty() {
                        output.insert(tag, text);
                    }
                }
            }
            Ok(Event::CData(event)) => {
                if let Some(tag) = current_tag.take() {
                    let text = String::from_utf8_lossy(event.as_ref()).trim().to_string();
                    if !text.is_empty() {
                        output.insert(tag, text);
                    }
                }
            }
            Ok(Event::End(_)) => {
                current_tag = None;
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(anyhow!("wecom xml parse failed: {err}")),
            _ => {}
        }
        buffer.clear();
    }
    Ok(output)
}

pub fn extract_inbound_message(xml_payload: &str) -> Result<Option<ParsedMessage>> {
    let fields = parse_xml_fields(xml_payload)?;
    let msg_type = fields
        .get("MsgType")
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if msg_type != "text" {
        return Ok(None);
    }

    let user_id = fields
        .get("FromUserName")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("invalid wecom payload: missing FromUserName"))?;
    let content = fields
        .get("Content")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("invalid wecom payload: missing Content"))?;
    let message_id = fields
        .get("MsgId")
        .or_else(|| fields.get("MsgID"))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    Ok(Some(ParsedMessage {
        external_user_id: user_id,
        external_user_name: None,
        text: content,
        message_type: msg_type,
        message_id,
        raw_payload: xml_payload.to_string(),
    }))
}

fn decode_encoding_aes_key(raw: &str) -> Result<Vec<u8>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(anyhow!("wecom encoding_aes_key missing"));
    }
    let padded = if raw.ends_with('=') {
        raw.to_string()
    } else {
        format!("{raw}=")
    };
    let key = base64::engine::general_purpose::STANDARD
        .decode(padded)
        .map_err(|_| anyhow!("wecom encoding_aes_key is invalid base64"))?;
    if key.len() != 32 {
        return Err(anyhow!("wecom encoding_aes_key length invalid"));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;
    use axum::http::HeaderMap;

    type Aes256CbcEnc = cbc::Encryptor<Aes256>;

    const CORP_ID: &str = "ww_corp";
    const TOKEN: &str = "wecom-token";

    fn aes_key() -> String {
        let raw: Vec<u8> = (0u8..32).collect();
        base64::engine::general_purpose::STANDARD
            .encode(raw)
            .trim_end_matches('=')
            .to_string()
    }

    fn encrypt(plain: &str) -> String {
        let key = decode_encoding_aes_key(&aes_key()).unwrap();
        let mut body = vec![7u8; 16];
        body.extend_from_slice(&(plain.len() as u32).to_be_bytes());
        body.extend_from_slice(plain.as_bytes());
        body.extend_from_slice(CORP_ID.as_bytes());
        let pad = WECOM_PAD_BLOCK - body.len() % WECOM_PAD_BLOCK;
        body.extend(std::iter::repeat(pad as u8).take(pad));
        let len = body.len();
        let cipher = Aes256CbcEnc::new(key.as_slice().into(), key[..16].into())
            .encrypt_padded_mut::<NoPadding>(&mut body, len)
            .unwrap()
            .to_vec();
        base64::engine::general_purpose::STANDARD.encode(cipher)
    }

    fn sign(timestamp: &str, nonce: &str, encrypted: &str) -> String {
        let mut parts = [TOKEN, timestamp, nonce, encrypted];
        parts.sort_unstable();
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    async fn adapter() -> WeComAdapter {
        let mut adapter = WeComAdapter::new(Client::new());
        adapter
            .init(&AdapterConfig::WeCom(WeComConfig {
                corp_id: Some(CORP_ID.to_string()),
                agent_id: Some("1000002".to_string()),
                secret: Some("secret".to_string()),
                token: Some(TOKEN.to_string()),
                encoding_aes_key: Some(aes_key()),
                domain: None,
            }))
            .await
            .unwrap();
        adapter
    }

    fn signed_query(encrypted: &str) -> HashMap<String, String> {
        HashMap::from([
            ("msg_signature".to_string(), sign("1710000000", "n1", encrypted)),
            ("timestamp".to_string(), "1710000000".to_string()),
            ("nonce".to_string(), "n1".to_string()),
        ])
    }

    #[test]
    fn verify_signature_with_sorted_parts() {
        let signature = sign("1710000000", "abc", "cipher_text");
        assert!(verify_signature(
            TOKEN,
            "1710000000",
            "abc",
            "cipher_text",
            &signature
        ));
        assert!(!verify_signature(
            TOKEN,
            "1710000001",
            "abc",
            "cipher_text",
            &signature
        ));
    }

    #[test]
    fn decrypt_handles_wide_padding() {
        // 填充前恰好 20 + 5 + 7 = 32 字节，因此后面跟一整块 32 字节填充。
        let encrypted = encrypt("hello");
        let plain = decrypt_payload(&encrypted, &aes_key(), Some(CORP_ID)).unwrap();
        assert_eq!(plain, "hello");
    }

    #[test]
    fn decrypt_rejects_foreign_receive_id() {
        let encrypted = encrypt("hello");
        assert!(decrypt_payload(&encrypted, &aes_key(), Some("other_corp")).is_err());
    }

    #[test]
    fn parse_xml_fields_extracts_text() {
        let xml =
            "<xml><MsgType><![CDATA[text]]></MsgType><Content><![CDATA[hello]]></Content></xml>";
        let fields = parse_xml_fields(xml).expect("xml should parse");
        assert_eq!(fields.get("MsgType").cloned(), Some("text".to_string()));
        assert_eq!(fields.get("Content").cloned(), Some("hello".to_string()));
    }

    #[test]
    fn extract_inbound_message_ignores_events() {
        let xml = "<xml><FromUserName><![CDATA[u1]]></FromUserName><MsgType><![CDATA[event]]></MsgType><Event><![CDATA[enter_agent]]></Event></xml>";
        assert!(extract_inbound_message(xml).unwrap().is_none());
    }

    #[tokio::test]
    async fn challenge_decrypts_signed_echostr() {
        let adapter = adapter().await;
        let echostr = encrypt("echo-1234");
        let mut query = signed_query(&echostr);
        query.insert("echostr".to_string(), echostr);
        let headers = HeaderMap::new();
        let request = WebhookRequest::new(b"", &headers, &query);
        assert_eq!(adapter.handle_challenge(&request).as_deref(), Some("echo-1234"));

        query.insert("msg_signature".to_string(), "0".repeat(40));
        let request = WebhookRequest::new(b"", &headers, &query);
        assert!(adapter.handle_challenge(&request).is_none());
    }

    #[tokio::test]
    async fn encrypted_text_message_is_verified_and_parsed() {
        let adapter = adapter().await;
        let inner = "<xml><FromUserName><![CDATA[zhangsan]]></FromUserName><MsgType><![CDATA[text]]></MsgType><Content><![CDATA[你好]]></Content><MsgId>7001</MsgId></xml>";
        let encrypted = encrypt(inner);
        let body = format!("<xml><ToUserName><![CDATA[{CORP_ID}]]></ToUserName><Encrypt><![CDATA[{encrypted}]]></Encrypt></xml>");
        let query = signed_query(&encrypted);
        let headers = HeaderMap::new();
        let request = WebhookRequest::new(body.as_bytes(), &headers, &query);

        assert!(adapter.verify_signature(&request));
        let parsed = adapter.parse_message(&request).unwrap().unwrap();
        assert_eq!(parsed.external_user_id, "zhangsan");
        assert_eq!(parsed.text, "你好");
        assert_eq!(parsed.message_id.as_deref(), Some("7001"));
    }

    #[tokio::test]
    async fn malformed_body_fails_verification_without_panicking() {
        let adapter = adapter().await;
        let query = HashMap::new();
        let headers = HeaderMap::new();
        let request = WebhookRequest::new(b"<xml><Encrypt>", &headers, &query);
        assert!(!adapter.verify_signature(&request));
    }
}
