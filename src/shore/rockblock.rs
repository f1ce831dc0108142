//! RockBLOCK HTTP backend for the shore driver.
//!
//! Mobile-terminated messages are POSTed as form parameters to the
//! RockBLOCK web service (`imei`, `username`, `password`, `data` in hex);
//! the reply body is `OK,<mtmsn>` or `FAILED,<code>,<reason>`.
//! Mobile-originated messages arrive as JSON callbacks on our own HTTP
//! endpoint, optionally authenticated with an HS256 JWT whose claims
//! repeat the callback fields.


use log::{debug, warn};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::driver::DriverError;

#[derive(Debug, Clone)]
pub struct RockBlockConfig {
    /// RockBLOCK MT submission endpoint.
    pub mt_endpoint: String,
    pub username: String,
    pub password: String,
    /// Our MO callback endpoint bind/port.
    pub mo_server_bind: String,
    pub mo_server_port: u16,
    /// Shared secret for verifying MO callback JWTs; `None` skips
    /// verification.
    pub mo_jwt_secret: Option<String>,
}

impl Default for RockBlockConfig {
    fn default() -> Self {
        RockBlockConfig {
            mt_endpoint: "https://rockblock.rock7.com/rockblock/MT".into(),
            username: String::new(),
            password: String::new(),
            mo_server_bind: "0.0.0.0".into(),
            mo_server_port: 8080,
            mo_jwt_secret: None,
        }
    }
}

/// Verify a compact HS256 JWS and return its claims.
fn verify_jwt(token: &str, secret: &str) -> Result<serde_json::Value, String> {
    let mut parts = token.split('.');
    let (Some(header), Some(claims), Some(signature)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err("not a compact JWS".into());
    };
    if parts.next().is_some() {
        return Err("too many JWS segments".into());
    }

    let header_json: serde_json::Value = serde_json::from_slice(
        &URL_SAFE_NO_PAD
            .decode(header)
            .map_err(|e| format!("bad header encoding: {e}"))?,
    )
    .map_err(|e| format!("bad header: {e}"))?;
    if header_json.get("alg").and_then(|a| a.as_str()) != Some("HS256") {
        return Err("unsupported JWS algorithm".into());
    }

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| format!("bad key: {e}"))?;
    mac.update(header.as_bytes());
    mac.update(b".");
    mac.update(claims.as_bytes());
    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|e| format!("bad signature encoding: {e}"))?;
    mac.verify_slice(&signature)
        .map_err(|_| "signature mismatch".to_string())?;

    serde_json::from_slice(
        &URL_SAFE_NO_PAD
            .decode(claims)
            .map_err(|e| format!("bad claims encoding: {e}"))?,
    )
    .map_err(|e| format!("bad claims: {e}"))
}

/// One decoded MO callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoCallback {
    pub imei: String,
    pub momsn: Option<u32>,
    pub payload: Vec<u8>,
}

fn parse_callback(
    body: &str,
    jwt_secret: Option<&str>,
) -> Result<MoCallback, String> {
    let mut json: serde_json::Value =
        serde_json::from_str(body).map_err(|e| format!("bad JSON: {e}"))?;

    if let Some(secret) = jwt_secret {
        let Some(token) = json.get("jwt").and_then(|j| j.as_str()) else {
            return Err("missing jwt".into());
        };
        // trusted fields come from the verified claims only
        json = verify_jwt(token, secret)?;
    }

    let imei = json
        .get("imei")
        .and_then(|v| v.as_str())
        .ok_or("missing imei")?
        .to_string();
    let momsn = json.get("momsn").and_then(|v| v.as_u64()).map(|v| v as u32);
    let data = json
        .get("data")
        .and_then(|v| v.as_str())
        .ok_or("missing data")?;
    let payload = hex::decode(data).map_err(|e| format!("bad hex data: {e}"))?;
    Ok(MoCallback {
        imei,
        momsn,
        payload,
    })
}

pub struct RockBlockBackend {
    cfg: RockBlockConfig,
    server: Option<tiny_http::Server>,
}

impl std::fmt::Debug for RockBlockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RockBlockBackend")
            .field("cfg", &self.cfg)
            .field("listening", &self.server.is_some())
            .finish()
    }
}

impl RockBlockBackend {
    pub fn new(cfg: RockBlockConfig) -> Self {
        RockBlockBackend { cfg, server: None }
    }

    pub fn start(&mut self) -> Result<(), DriverError> {
        let addr = format!("{}:{}", self.cfg.mo_server_bind, self.cfg.mo_server_port);
        let server = tiny_http::Server::http(&addr)
            .map_err(|e| DriverError::StartupFailed(format!("bind {addr}: {e}")))?;
        debug!("RockBLOCK MO endpoint listening on {addr}");
        self.server = Some(server);
        Ok(())
    }

    pub fn local_port(&self) -> Option<u16> {
        self.server.as_ref().and_then(|s| match s.server_addr() {
            tiny_http::ListenAddr::IP(addr) => Some(addr.port()),
            #[allow(unreachable_patterns)]
            _ => None,
        })
    }

    pub fn close(&mut self) {
        self.server = None;
    }

    /// Drain pending MO callbacks without blocking.
    pub fn poll_mo(&mut self) -> Vec<MoCallback> {
        let Some(server) = &self.server else {
            return Vec::new();
        };
        let mut callbacks = Vec::new();
        loop {
            match server.try_recv() {
                Ok(Some(mut request)) => {
                    let mut body = String::new();
                    if let Err(e) = request.as_reader().read_to_string(&mut body) {
                        warn!("unreadable MO callback: {e}");
                        let _ = request.respond(
                            tiny_http::Response::from_string("FAILED,10,bad body")
                                .with_status_code(400),
                        );
                        continue;
                    }
                    match parse_callback(&body, self.cfg.mo_jwt_secret.as_deref()) {
                        Ok(callback) => {
                            debug!(
                                "MO callback from imei {} ({} bytes)",
                                callback.imei,
                                callback.payload.len()
                            );
                            callbacks.push(callback);
                            let _ = request
                                .respond(tiny_http::Response::from_string("OK"));
                        }
                        Err(e) => {
                            warn!("rejected MO callback: {e}");
                            let _ = request.respond(
                                tiny_http::Response::from_string(format!("FAILED,11,{e}"))
                                    .with_status_code(400),
                            );
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("MO endpoint receive failed: {e}");
                    break;
                }
            }
        }
        callbacks
    }

    /// POST one MT message for `imei`.
    pub fn send_mt(&mut self, payload: &[u8], imei: &str) -> Result<(), DriverError> {
        let response = ureq::post(&self.cfg.mt_endpoint)
            .send_form(&[
                ("imei", imei),
                ("username", self.cfg.username.as_str()),
                ("password", self.cfg.password.as_str()),
                ("data", hex::encode(payload).as_str()),
            ])
            .map_err(|e| DriverError::ConnectionFailed(format!("MT POST failed: {e}")))?;

        let body = response
            .into_string()
            .map_err(|e| DriverError::ConnectionFailed(e.to_string()))?;
        if let Some(mtmsn) = body.strip_prefix("OK,") {
            debug!("MT accepted, mtmsn {}", mtmsn.trim());
        } else {
            warn!("MT rejected: {}", body.trim());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(claims: &serde_json::Value, secret: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(body.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{header}.{body}.{sig}")
    }

    #[test]
    fn callback_without_jwt() {
        let body = r#"{"imei":"300234010753370","momsn":12,"data":"48656c6c6f"}"#;
        let callback = parse_callback(body, None).unwrap();
        assert_eq!(callback.imei, "300234010753370");
        assert_eq!(callback.momsn, Some(12));
        assert_eq!(callback.payload, b"Hello".to_vec());
    }

    #[test]
    fn callback_with_valid_jwt() {
        let claims = serde_json::json!({
            "imei": "300234010753370",
            "momsn": 3,
            "data": "abcd"
        });
        let token = sign(&claims, "sekrit");
        let body = serde_json::json!({ "jwt": token }).to_string();
        let callback = parse_callback(&body, Some("sekrit")).unwrap();
        assert_eq!(callback.payload, vec![0xab, 0xcd]);
    }

    #[test]
    fn callback_with_bad_signature_is_rejected() {
        let claims = serde_json::json!({
            "imei": "300234010753370",
            "data": "abcd"
        });
        let token = sign(&claims, "wrong-secret");
        let body = serde_json::json!({ "jwt": token }).to_string();
        assert!(parse_callback(&body, Some("sekrit")).is_err());

        // missing jwt entirely
        let body = r#"{"imei":"300234010753370","data":"abcd"}"#;
        assert!(parse_callback(body, Some("sekrit")).is_err());
    }
}
