//! Shareable links: `{base}/{document_id}?room={hex(secret)}`.
//!
//! Anyone holding the link can join the room, so the secret travels in the
//! link and nowhere else. The relay only ever sees the derived room token.

use url::Url;

use crate::error::CollabError;

/// Query parameter carrying the hex-encoded room secret.
const ROOM_PARAM: &str = "room";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareLink {
    pub base_url: String,
    pub document_id: String,
    pub room_secret: String,
}

impl ShareLink {
    pub fn new(
        base_url: impl Into<String>,
        document_id: impl Into<String>,
        room_secret: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            document_id: document_id.into(),
            room_secret: room_secret.into(),
        }
    }

    /// Fails only when `base_url` cannot carry a path.
    pub fn to_url(&self) -> Result<String, CollabError> {
        let mut url = parse_base(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| invalid(&self.base_url, "base cannot carry a path"))?
            .pop_if_empty()
            .push(&self.document_id);
        url.query_pairs_mut()
            .clear()
            .append_pair(ROOM_PARAM, &hex::encode(self.room_secret.as_bytes()));
        Ok(url.into())
    }

    /// Parse a link produced by [`to_url`](Self::to_url).
    pub fn parse(link: &str) -> Result<Self, CollabError> {
        let mut url = Url::parse(link).map_err(|e| invalid(link, &e.to_string()))?;

        let room = url
            .query_pairs()
            .find(|(key, _)| key == ROOM_PARAM)
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| invalid(link, "missing room parameter"))?;
        let secret = hex::decode(&room).map_err(|_| invalid(link, "room is not hex"))?;
        let room_secret = String::from_utf8(secret).map_err(|_| invalid(link, "room is not UTF-8"))?;

        let document_id = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|doc| !doc.is_empty())
            .ok_or_else(|| invalid(link, "missing document id"))?;
        let document_id = urlencoding::decode(document_id)
            .map_err(|_| invalid(link, "bad escape in document id"))?
            .into_owned();

        url.set_query(None);
        url.set_fragment(None);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop();
        }

        Ok(Self {
            base_url: url.as_str().trim_end_matches('/').to_string(),
            document_id,
            room_secret,
        })
    }
}

/// Parse a base URL that can be extended with a document segment.
pub(crate) fn parse_base(base: &str) -> Result<Url, CollabError> {
    let url = Url::parse(base).map_err(|e| invalid(base, &e.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(invalid(base, "base cannot carry a path"));
    }
    Ok(url)
}

fn invalid(link: &str, why: &str) -> CollabError {
    CollabError::Config(format!("invalid share link {link:?}: {why}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_shape() {
        let link = ShareLink::new("https://blog.example/collab/", "post-42", "ab");
        assert_eq!(link.to_url().unwrap(), "https://blog.example/collab/post-42?room=6162");
    }

    #[test]
    fn test_parse_own_output() {
        let link = ShareLink::new("http://localhost:3000/collab", "drafts/2026 plan", "s3cr3t!");
        let url = link.to_url().unwrap();
        assert!(!url.contains(' '));
        assert!(url.contains("drafts%2F2026%20plan"), "{url}");
        assert_eq!(ShareLink::parse(&url).unwrap(), link);
    }

    #[test]
    fn test_parse_ignores_other_params() {
        let link = ShareLink::parse("http://h/c/doc?ref=mail&room=7a").unwrap();
        assert_eq!(link.document_id, "doc");
        assert_eq!(link.room_secret, "z");
    }

    #[test]
    fn test_root_base_roundtrips() {
        let link = ShareLink::new("https://folio.example", "a#b", "x");
        let parsed = ShareLink::parse(&link.to_url().unwrap()).unwrap();
        assert_eq!(parsed, link);
    }

    #[test]
    fn test_unusable_base_is_rejected() {
        let link = ShareLink::new("mailto:someone@example.com", "doc", "x");
        assert!(matches!(link.to_url(), Err(CollabError::Config(_))));
        assert!(parse_base("not a url").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["http://h/c/doc", "http://h/c/doc?room=zz", "doc?room=61", "http://h/c/?room=61"] {
            assert!(matches!(ShareLink::parse(bad), Err(CollabError::Config(_))), "{bad}");
        }
    }
}
