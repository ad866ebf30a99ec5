use mimic_core::config::AuthConfig;
use mimic_core::services::totp::{generate_secret, provisioning_uri, Totp, SECRET_BYTES};

// RFC 6238 appendix B, SHA-1 key "12345678901234567890".
const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

fn eight_digits() -> AuthConfig {
    AuthConfig {
        digits: 8,
        ..AuthConfig::default()
    }
}

#[test]
fn matches_rfc6238_vectors() -> anyhow::Result<()> {
    let totp = Totp::from_base32(RFC_SECRET)?.with_config(&eight_digits());
    assert_eq!(totp.code_at(59), "94287082");
    assert_eq!(totp.code_at(1_111_111_109), "07081804");
    assert_eq!(totp.code_at(1_234_567_890), "89005924");
    assert_eq!(totp.code_at(2_000_000_000), "69279037");

    // Six digits is the same value truncated.
    let six = Totp::from_base32(RFC_SECRET)?;
    assert_eq!(six.code_at(59), "287082");
    Ok(())
}

#[test]
fn generated_secret_round_trips_and_rejects_other_secrets() -> anyhow::Result<()> {
    let secret = generate_secret();
    assert_eq!(secret.len(), 32, "160-bit secret is 32 base32 chars");
    assert!(secret.chars().all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c)));
    assert_eq!(SECRET_BYTES * 8, 160);

    let totp = Totp::from_base32(&secret)?;
    let mut foreign_hits = 0;
    for t in [0u64, 59, 1_700_000_000, 1_700_000_030, 4_000_000_000] {
        let code = totp.code_at(t);
        assert!(totp.verify_at(&code, t));
        let other = Totp::from_base32(&generate_secret())?;
        if other.verify_at(&code, t) {
            foreign_hits += 1;
        }
    }
    // Each foreign check has ~3e-6 odds of colliding.
    assert!(foreign_hits <= 1);
    Ok(())
}

#[test]
fn accepts_one_step_of_drift_only() -> anyhow::Result<()> {
    let totp = Totp::from_base32(RFC_SECRET)?;
    let t = 1_700_000_015;
    let code = totp.code_at(t);
    assert!(totp.verify_at(&code, t - 30));
    assert!(totp.verify_at(&code, t + 30));
    assert!(!totp.verify_at(&code, t + 90));
    assert!(!totp.verify_at(&code, t - 90));
    Ok(())
}

#[test]
fn rejects_malformed_codes() -> anyhow::Result<()> {
    let totp = Totp::from_base32(RFC_SECRET)?;
    let code = totp.code_at(59);
    assert!(totp.verify_at(&format!(" {code} "), 59), "surrounding space is trimmed");
    assert!(!totp.verify_at("", 59));
    assert!(!totp.verify_at("12345", 59));
    assert!(!totp.verify_at("1234567", 59));
    assert!(!totp.verify_at("abcdef", 59));
    Ok(())
}

#[test]
fn secret_decoding_is_lenient_about_case_padding_and_spaces() {
    let a = Totp::from_base32(RFC_SECRET).unwrap();
    let b = Totp::from_base32("gezd gnbv gy3t qojq gezd gnbv gy3t qojq").unwrap();
    let c = Totp::from_base32(&format!("{RFC_SECRET}====")).unwrap();
    assert_eq!(a.code_at(59), b.code_at(59));
    assert_eq!(a.code_at(59), c.code_at(59));

    assert!(Totp::from_base32("").is_err());
    assert!(Totp::from_base32("not base32!").is_err());
}

#[test]
fn provisioning_uri_encodes_issuer_and_account() {
    let cfg = AuthConfig::default();
    let uri = provisioning_uri("ABCDEF", "10.0.0.7", "haKC.ai - AnythingYouCanDo App", &cfg);
    assert_eq!(
        uri,
        "otpauth://totp/haKC.ai%20-%20AnythingYouCanDo%20App:10.0.0.7?secret=ABCDEF&issuer=haKC.ai%20-%20AnythingYouCanDo%20App"
    );

    let v6 = provisioning_uri("ABCDEF", "fe80::1", "x", &cfg);
    assert!(v6.starts_with("otpauth://totp/x:fe80%3A%3A1?"));

    let uri = provisioning_uri("ABCDEF", "a", "x", &eight_digits());
    assert!(uri.ends_with("&digits=8"));
}
