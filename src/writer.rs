//! Fragment-streaming envelope writer.
//!
//! The envelope is emitted in strictly ordered fragments so the body bytes
//! exist exactly once: the same fragment that is hashed for the signature is
//! the one serialized into the message. Calling a write method out of order
//! is a caller bug and reports as a usage error, never as a malformed
//! message.

use crate::error::{Result, WsSecurityError};
use crate::header::{SoapVersion, DS_NS, WSC_NS, WSSE_NS, WSU_NS, XENC_NS};
use crate::xml_escape;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Canonical byte form of a signed body. Both the outgoing signer and the
/// incoming verifier compute signatures over exactly this string.
pub fn canonical_body(body_id: &str, content: &str) -> String {
    format!(
        r#"<soap:Body wsu:Id="{}">{content}</soap:Body>"#,
        xml_escape(body_id)
    )
}

/// Byte form covered by the primary signature MAC. The timestamp fields and
/// the replay nonce are bound together with the canonical body, so none of
/// them can be altered or swapped after signing. The nonce is folded in as
/// base64 to keep the newline field boundaries unambiguous.
pub fn signing_input(created: &str, expires: &str, nonce: &[u8], canonical: &str) -> Vec<u8> {
    let nonce = BASE64.encode(nonce);
    let mut input =
        Vec::with_capacity(created.len() + expires.len() + nonce.len() + canonical.len() + 4);
    for field in [created, expires, nonce.as_str(), canonical] {
        input.extend_from_slice(field.as_bytes());
        input.push(b'\n');
    }
    input
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Created,
    EnvelopeOpen,
    HeaderOpen,
    HeaderClosed,
    BodyOpen,
    BodyClosed,
    Finished,
}

/// Streams a SOAP envelope as three fragments: everything before the body,
/// the body itself, and everything after.
pub struct EnvelopeWriter {
    version: SoapVersion,
    state: WriterState,
    pre_body: String,
    body_id: Option<String>,
    body_content: String,
    post_body: String,
}

impl EnvelopeWriter {
    pub fn new(version: SoapVersion) -> Self {
        Self {
            version,
            state: WriterState::Created,
            pre_body: String::new(),
            body_id: None,
            body_content: String::new(),
            post_body: String::new(),
        }
    }

    fn expect(&self, want: WriterState, operation: &str) -> Result<()> {
        if self.state != want {
            return Err(WsSecurityError::Usage(format!(
                "{operation} called in state {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Open the envelope, declaring every namespace used by header elements
    /// so fragments can be emitted prefix-only.
    pub fn start_envelope(&mut self) -> Result<()> {
        self.expect(WriterState::Created, "start_envelope")?;
        self.pre_body.push_str(&format!(
            r#"<soap:Envelope xmlns:soap="{}" xmlns:wsse="{WSSE_NS}" xmlns:wsu="{WSU_NS}" xmlns:ds="{DS_NS}" xmlns:xenc="{XENC_NS}" xmlns:wsc="{WSC_NS}">"#,
            self.version.namespace()
        ));
        self.state = WriterState::EnvelopeOpen;
        Ok(())
    }

    /// Open `<soap:Header><wsse:Security>`.
    pub fn start_header(&mut self) -> Result<()> {
        self.expect(WriterState::EnvelopeOpen, "start_header")?;
        self.pre_body
            .push_str(r#"<soap:Header><wsse:Security soap:mustUnderstand="1">"#);
        self.state = WriterState::HeaderOpen;
        Ok(())
    }

    /// Append a serialized security header element.
    pub fn write_header_element(&mut self, fragment: &str) -> Result<()> {
        self.expect(WriterState::HeaderOpen, "write_header_element")?;
        self.pre_body.push_str(fragment);
        Ok(())
    }

    pub fn end_header(&mut self) -> Result<()> {
        self.expect(WriterState::HeaderOpen, "end_header")?;
        self.pre_body.push_str("</wsse:Security></soap:Header>");
        self.state = WriterState::HeaderClosed;
        Ok(())
    }

    /// Open the body with its `wsu:Id`. The id becomes part of the canonical
    /// byte form, so callers reuse an inbound id when one exists.
    pub fn start_body(&mut self, body_id: &str) -> Result<()> {
        self.expect(WriterState::HeaderClosed, "start_body")?;
        self.body_id = Some(body_id.to_string());
        self.state = WriterState::BodyOpen;
        Ok(())
    }

    /// Append raw body content. May be called repeatedly; fragments
    /// concatenate in call order.
    pub fn write_body_content(&mut self, fragment: &str) -> Result<()> {
        self.expect(WriterState::BodyOpen, "write_body_content")?;
        self.body_content.push_str(fragment);
        Ok(())
    }

    pub fn end_body(&mut self) -> Result<()> {
        self.expect(WriterState::BodyOpen, "end_body")?;
        self.state = WriterState::BodyClosed;
        Ok(())
    }

    /// The canonical body fragment as written so far. Only meaningful once
    /// the body is closed.
    pub fn body_fragment(&self) -> Result<String> {
        let body_id = match (&self.state, &self.body_id) {
            (WriterState::BodyClosed | WriterState::Finished, Some(id)) => id,
            _ => {
                return Err(WsSecurityError::Usage(
                    "body_fragment requires a closed body".to_string(),
                ))
            }
        };
        Ok(canonical_body(body_id, &self.body_content))
    }

    /// Replace the buffered body content. Used when the body is transformed
    /// after writing (encryption of already-streamed content).
    pub fn replace_body_content(&mut self, content: String) -> Result<()> {
        self.expect(WriterState::BodyClosed, "replace_body_content")?;
        self.body_content = content;
        Ok(())
    }

    /// Close the envelope and assemble the three fragments.
    pub fn finish(mut self) -> Result<String> {
        self.expect(WriterState::BodyClosed, "finish")?;
        self.post_body.push_str("</soap:Envelope>");
        self.state = WriterState::Finished;
        let body = self.body_fragment()?;
        let mut out = String::with_capacity(self.pre_body.len() + body.len() + self.post_body.len());
        out.push_str(&self.pre_body);
        out.push_str(&body);
        out.push_str(&self.post_body);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(version: SoapVersion) -> String {
        let mut w = EnvelopeWriter::new(version);
        w.start_envelope().unwrap();
        w.start_header().unwrap();
        w.write_header_element("<wsu:Timestamp/>").unwrap();
        w.end_header().unwrap();
        w.start_body("body-1").unwrap();
        w.write_body_content("<m:Ping>hi</m:Ping>").unwrap();
        w.end_body().unwrap();
        w.finish().unwrap()
    }

    #[test]
    fn test_fragments_assemble_in_order() {
        let xml = written(SoapVersion::Soap11);
        assert!(xml.starts_with("<soap:Envelope"));
        assert!(xml.contains("<wsu:Timestamp/>"));
        assert!(xml.contains(r#"<soap:Body wsu:Id="body-1"><m:Ping>hi</m:Ping></soap:Body>"#));
        assert!(xml.ends_with("</soap:Envelope>"));
        let header_at = xml.find("wsse:Security").unwrap();
        let body_at = xml.find("soap:Body").unwrap();
        assert!(header_at < body_at);
    }

    #[test]
    fn test_soap_12_namespace() {
        let xml = written(SoapVersion::Soap12);
        assert!(xml.contains("http://www.w3.org/2003/05/soap-envelope"));
    }

    #[test]
    fn test_emitted_body_parses_back() {
        let xml = written(SoapVersion::Soap11);
        let parsed = crate::header::parse_envelope(xml.as_bytes()).unwrap();
        assert_eq!(parsed.body_id.as_deref(), Some("body-1"));
        assert_eq!(parsed.body_inner, "<m:Ping>hi</m:Ping>");
        // Round-tripping preserves the canonical byte form.
        assert_eq!(
            canonical_body(parsed.body_id.as_deref().unwrap(), &parsed.body_inner),
            canonical_body("body-1", "<m:Ping>hi</m:Ping>")
        );
    }

    #[test]
    fn test_out_of_order_write_is_usage_error() {
        let mut w = EnvelopeWriter::new(SoapVersion::Soap11);
        let err = w.start_body("b").unwrap_err();
        assert!(matches!(err, WsSecurityError::Usage(_)));

        w.start_envelope().unwrap();
        let err = w.write_body_content("x").unwrap_err();
        assert!(matches!(err, WsSecurityError::Usage(_)));

        let err = w.start_envelope().unwrap_err();
        assert!(matches!(err, WsSecurityError::Usage(_)));
    }

    #[test]
    fn test_body_fragment_requires_closed_body() {
        let mut w = EnvelopeWriter::new(SoapVersion::Soap11);
        w.start_envelope().unwrap();
        w.start_header().unwrap();
        w.end_header().unwrap();
        w.start_body("b").unwrap();
        assert!(w.body_fragment().is_err());
        w.end_body().unwrap();
        assert_eq!(w.body_fragment().unwrap(), canonical_body("b", ""));
    }

    #[test]
    fn test_signing_input_binds_every_field() {
        let base = signing_input("c", "e", b"n", "<soap:Body/>");
        assert_ne!(base, signing_input("c2", "e", b"n", "<soap:Body/>"));
        assert_ne!(base, signing_input("c", "e2", b"n", "<soap:Body/>"));
        assert_ne!(base, signing_input("c", "e", b"m", "<soap:Body/>"));
        assert_ne!(base, signing_input("c", "e", b"n", "<soap:Body>x</soap:Body>"));
    }

    #[test]
    fn test_body_id_is_escaped() {
        assert_eq!(
            canonical_body(r#"a"b"#, ""),
            r#"<soap:Body wsu:Id="a&quot;b"></soap:Body>"#
        );
    }
}
