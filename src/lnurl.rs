use std::{io::Cursor, sync::Arc};

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use bech32::{ToBase32, Variant};
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::QrCode;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    challenge::{Challenge, ChallengeStore},
    signature,
};

const TAG: &str = "login";
const ACTION: &str = "login";
const LNURL_HRP: &str = "lnurl";

#[derive(Debug, Error)]
pub enum LnurlError {
    #[error("lnurl encoding failed: {0}")]
    Encode(#[from] bech32::Error),
    #[error("qr code generation failed: {0}")]
    Qr(#[from] qrcode::types::QrError),
    #[error("qr image rendering failed: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Debug, Clone)]
pub struct GeneratedChallenge {
    pub k1: String,
    pub lnurl: String,
    /// Base64 PNG of the encoded LNURL.
    pub qr_code: String,
    pub expires_at: DateTime<Utc>,
}

/// LNURL-auth login flow. A challenge moves PENDING -> VERIFIED once a
/// wallet returns a valid signature, or expires after five minutes.
pub struct LnurlAuthService {
    domain: String,
    challenges: Arc<ChallengeStore>,
}

impl LnurlAuthService {
    pub fn new(domain: impl Into<String>, challenges: Arc<ChallengeStore>) -> Self {
        let domain = domain.into();
        info!("lnurl-auth callbacks served from {domain}");
        Self { domain, challenges }
    }

    pub fn callback_url(&self, k1: &str) -> String {
        format!(
            "https://{}/api/auth/lnurl/callback?tag={TAG}&k1={k1}&action={ACTION}",
            self.domain
        )
    }

    pub fn generate_challenge(&self) -> Result<GeneratedChallenge, LnurlError> {
        let (k1, expires_at) = self.challenges.create();
        let lnurl = encode_lnurl(&self.callback_url(&k1))?;
        let qr_code = qr_png_base64(&lnurl)?;
        debug!("issued challenge {k1}, expires {expires_at}");

        Ok(GeneratedChallenge {
            k1,
            lnurl,
            qr_code,
            expires_at,
        })
    }

    /// Check a wallet's signature over `k1`. Every failure, including bad
    /// hex and unknown or spent challenges, is reported as `false`.
    pub fn verify_signature(&self, k1: &str, sig_hex: &str, pubkey_hex: &str) -> bool {
        let Some(challenge) = self.challenges.get(k1) else {
            debug!("challenge {k1} not found or expired");
            return false;
        };
        if challenge.verified {
            debug!("challenge {k1} already verified");
            return false;
        }

        let decoded = (hex::decode(k1), hex::decode(sig_hex), hex::decode(pubkey_hex));
        let (Ok(k1_bytes), Ok(sig), Ok(pubkey)) = decoded else {
            debug!("malformed hex in callback for {k1}");
            return false;
        };
        let Ok(k1_bytes) = <[u8; 32]>::try_from(k1_bytes.as_slice()) else {
            return false;
        };

        if !signature::verify(&k1_bytes, &sig, &pubkey) {
            warn!("signature verification failed for challenge {k1}");
            return false;
        }

        let pubkey = pubkey_hex.to_ascii_lowercase();
        let won = self.challenges.mark_verified(k1, &pubkey);
        if won {
            info!("challenge {k1} verified for {pubkey}");
        }
        won
    }

    pub fn get_pubkey_from_challenge(&self, k1: &str) -> Option<String> {
        self.challenges
            .get(k1)
            .filter(|c| c.verified)
            .and_then(|c| c.pubkey)
    }

    pub fn get_challenge_data(&self, k1: &str) -> Option<Challenge> {
        self.challenges.get(k1)
    }
}

/// Bech32 with the `lnurl` prefix, upper-cased for compact QR codes.
pub fn encode_lnurl(url: &str) -> Result<String, bech32::Error> {
    let encoded = bech32::encode(LNURL_HRP, url.as_bytes().to_base32(), Variant::Bech32)?;
    Ok(encoded.to_uppercase())
}

fn qr_png_base64(data: &str) -> Result<String, LnurlError> {
    let code = QrCode::new(data.as_bytes())?;
    let img = code
        .render::<Luma<u8>>()
        .module_dimensions(10, 10)
        .build();

    let mut png = Vec::new();
    DynamicImage::ImageLuma8(img).write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(B64.encode(png))
}
