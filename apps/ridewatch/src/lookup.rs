//! Free-text place search, used only to recenter the map.

use serde::Deserialize;
use shared::LatLng;

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("place lookup request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("place lookup returned bad coordinates: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct Place {
    lat: String,
    lon: String,
}

/// Nominatim-compatible search client.
#[derive(Debug, Clone)]
pub struct PlaceLookup {
    client: reqwest::Client,
    base_url: String,
}

impl PlaceLookup {
    pub fn new(base_url: impl Into<String>) -> Result<Self, LookupError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ridewatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn search_url(&self, place: &str) -> String {
        format!(
            "{}/search?city={}&format=json",
            self.base_url,
            urlencoding::encode(place.trim())
        )
    }

    /// Best match for `place`, or `Ok(None)` when nothing matches.
    pub async fn find(&self, place: &str) -> Result<Option<LatLng>, LookupError> {
        if place.trim().is_empty() {
            return Ok(None);
        }
        let url = self.search_url(place);
        let places: Vec<Place> = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let found = best_match(&places)?;
        tracing::debug!(place, ?found, "place lookup finished");
        Ok(found)
    }
}

fn best_match(places: &[Place]) -> Result<Option<LatLng>, LookupError> {
    let Some(first) = places.first() else {
        return Ok(None);
    };
    let lat = first
        .lat
        .parse::<f64>()
        .map_err(|_| LookupError::Malformed(first.lat.clone()))?;
    let lon = first
        .lon
        .parse::<f64>()
        .map_err(|_| LookupError::Malformed(first.lon.clone()))?;
    Ok(Some(LatLng::new(lat, lon)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> Result<Option<LatLng>, LookupError> {
        let places: Vec<Place> = serde_json::from_str(body).unwrap();
        best_match(&places)
    }

    #[test]
    fn first_result_wins() {
        let body = r#"[
            {"place_id": 1, "lat": "24.8607", "lon": "67.0011", "display_name": "Karachi"},
            {"place_id": 2, "lat": "0", "lon": "0", "display_name": "Elsewhere"}
        ]"#;
        assert_eq!(parse(body).unwrap(), Some(LatLng::new(24.8607, 67.0011)));
    }

    #[test]
    fn empty_result_is_not_found() {
        assert!(parse("[]").unwrap().is_none());
    }

    #[test]
    fn garbage_coordinates_are_an_error() {
        let body = r#"[{"lat": "north", "lon": "67.0"}]"#;
        assert!(matches!(parse(body), Err(LookupError::Malformed(_))));
    }

    #[test]
    fn query_is_url_encoded() {
        let lookup = PlaceLookup::new("https://nominatim.example/").unwrap();
        assert_eq!(
            lookup.search_url(" New York "),
            "https://nominatim.example/search?city=New%20York&format=json"
        );
    }

    #[tokio::test]
    async fn blank_query_skips_the_request() {
        let lookup = PlaceLookup::new("http://127.0.0.1:9").unwrap();
        assert!(lookup.find("   ").await.unwrap().is_none());
    }
}
