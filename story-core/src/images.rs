//! Image lookup and generation for image messages.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::Rng;
use tracing::warn;

const STOCK_DEFAULT: &str = "https://images.pexels.com/photos/1314544/pexels-photo-1314544.jpeg";

/// Keyword to stock photo, checked in order.
const STOCK_IMAGES: [(&str, &str); 6] = [
    ("glitch", "https://images.pexels.com/photos/1054289/pexels-photo-1054289.jpeg"),
    ("supernatural", STOCK_DEFAULT),
    ("town", "https://images.pexels.com/photos/1105766/pexels-photo-1105766.jpeg"),
    ("mystery", "https://images.pexels.com/photos/1090638/pexels-photo-1090638.jpeg"),
    ("horror", "https://images.pexels.com/photos/1624438/pexels-photo-1624438.jpeg"),
    ("future", "https://images.pexels.com/photos/3913025/pexels-photo-3913025.jpeg"),
];

/// Stock photo for the first keyword found in the prompt.
pub fn stock_image_url(prompt: &str) -> &'static str {
    let prompt = prompt.to_lowercase();
    STOCK_IMAGES
        .iter()
        .find(|(keyword, _)| prompt.contains(keyword))
        .map(|(_, url)| *url)
        .unwrap_or(STOCK_DEFAULT)
}

/// Visual theme for placeholder images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicsumTheme {
    Horror,
    Mystery,
    Supernatural,
    Romance,
    Futuristic,
    Character,
    Landscape,
}

impl PicsumTheme {
    pub fn from_prompt(prompt: &str) -> Self {
        let prompt = prompt.to_lowercase();
        let has = |words: [&str; 2]| words.iter().any(|w| prompt.contains(w));

        if has(["horror", "scary"]) {
            PicsumTheme::Horror
        } else if has(["mystery", "suspense"]) {
            PicsumTheme::Mystery
        } else if has(["supernatural", "ghost"]) {
            PicsumTheme::Supernatural
        } else if has(["romance", "love"]) {
            PicsumTheme::Romance
        } else if has(["future", "sci-fi"]) {
            PicsumTheme::Futuristic
        } else if has(["landscape", "scenery"]) {
            PicsumTheme::Landscape
        } else {
            PicsumTheme::Character
        }
    }

    fn base_seed(&self) -> u32 {
        match self {
            PicsumTheme::Horror => 400,
            PicsumTheme::Mystery => 500,
            PicsumTheme::Supernatural => 600,
            PicsumTheme::Romance => 700,
            PicsumTheme::Futuristic => 800,
            PicsumTheme::Character => 900,
            PicsumTheme::Landscape => 1000,
        }
    }

    fn dimensions(&self) -> &'static str {
        match self {
            PicsumTheme::Landscape => "800/400",
            _ => "400/600",
        }
    }

    fn grayscale(&self) -> bool {
        matches!(
            self,
            PicsumTheme::Horror | PicsumTheme::Mystery | PicsumTheme::Supernatural
        )
    }

    fn blur(&self) -> Option<u8> {
        match self {
            PicsumTheme::Horror => Some(2),
            PicsumTheme::Mystery => Some(1),
            _ => None,
        }
    }

    /// URL for this theme; `offset` is added to the theme's base seed.
    pub fn url(&self, offset: u32) -> String {
        let mut url = format!(
            "https://picsum.photos/{}?random={}",
            self.dimensions(),
            self.base_seed() + offset
        );
        if self.grayscale() {
            url.push_str("&grayscale");
        }
        if let Some(blur) = self.blur() {
            url.push_str(&format!("&blur={blur}"));
        }
        url
    }
}

/// Themed random placeholder image for the prompt.
pub fn picsum_url(prompt: &str) -> String {
    let offset = rand::thread_rng().gen_range(0..100);
    PicsumTheme::from_prompt(prompt).url(offset)
}

/// Encode raw image bytes as a `data:` URL.
pub fn data_url(content_type: &str, bytes: &[u8]) -> String {
    format!("data:{content_type};base64,{}", STANDARD.encode(bytes))
}

#[derive(Clone, Default)]
enum ImageSource {
    #[default]
    Placeholder,
    Stock,
    Generated(genai::HuggingFace),
}

/// Image source for image messages.
///
/// Generated images fall back to themed placeholders; stock images come from
/// a fixed keyword map.
#[derive(Clone, Default)]
pub struct ImageProvider {
    source: ImageSource,
}

impl ImageProvider {
    /// Placeholder-only provider.
    pub fn placeholder() -> Self {
        Self {
            source: ImageSource::Placeholder,
        }
    }

    /// Keyword-matched stock photos.
    pub fn stock() -> Self {
        Self {
            source: ImageSource::Stock,
        }
    }

    /// Try Hugging Face first.
    pub fn with_generator(generator: genai::HuggingFace) -> Self {
        Self {
            source: ImageSource::Generated(generator),
        }
    }

    /// An image URL for the prompt. Never fails.
    pub async fn generate_image(&self, prompt: &str) -> String {
        match &self.source {
            ImageSource::Placeholder => picsum_url(prompt),
            ImageSource::Stock => stock_image_url(prompt).to_string(),
            ImageSource::Generated(generator) => match generator.generate_image(prompt).await {
                Ok(image) => data_url(&image.content_type, &image.bytes),
                Err(e) => {
                    warn!(error = %e, "image generation failed, using placeholder");
                    picsum_url(prompt)
                }
            },
        }
    }
}

impl std::fmt::Debug for ImageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match self.source {
            ImageSource::Placeholder => "placeholder",
            ImageSource::Stock => "stock",
            ImageSource::Generated(_) => "huggingface",
        };
        f.debug_struct("ImageProvider").field("source", &source).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stock_image_keywords() {
        assert!(stock_image_url("A GLITCH in the sky").contains("1054289"));
        assert!(stock_image_url("the town square").contains("1105766"));
        assert_eq!(stock_image_url("a quiet cafe"), STOCK_DEFAULT);
        // first match wins
        assert!(stock_image_url("horror glitch").contains("1054289"));
    }

    #[test]
    fn test_theme_selection() {
        assert_eq!(PicsumTheme::from_prompt("A scary hallway"), PicsumTheme::Horror);
        assert_eq!(PicsumTheme::from_prompt("ghost at the window"), PicsumTheme::Supernatural);
        assert_eq!(PicsumTheme::from_prompt("sci-fi lab"), PicsumTheme::Futuristic);
        assert_eq!(PicsumTheme::from_prompt("rolling scenery"), PicsumTheme::Landscape);
        assert_eq!(PicsumTheme::from_prompt("Maya smiling"), PicsumTheme::Character);
        assert_eq!(PicsumTheme::from_prompt("a suspense thriller"), PicsumTheme::Mystery);
        assert_eq!(PicsumTheme::from_prompt("love letter"), PicsumTheme::Romance);
    }

    #[test]
    fn test_theme_urls() {
        assert_eq!(
            PicsumTheme::Horror.url(7),
            "https://picsum.photos/400/600?random=407&grayscale&blur=2"
        );
        assert_eq!(
            PicsumTheme::Supernatural.url(0),
            "https://picsum.photos/400/600?random=600&grayscale"
        );
        assert_eq!(
            PicsumTheme::Landscape.url(99),
            "https://picsum.photos/800/400?random=1099"
        );
    }

    #[test]
    fn test_picsum_seed_in_theme_range() {
        for _ in 0..20 {
            let url = picsum_url("mystery note");
            let seed: u32 = url
                .split("random=")
                .nth(1)
                .and_then(|rest| rest.split('&').next())
                .and_then(|s| s.parse().ok())
                .expect("seed");
            assert!((500..600).contains(&seed));
            assert!(url.ends_with("&grayscale&blur=1"));
        }
    }

    #[test]
    fn test_data_url() {
        assert_eq!(data_url("image/png", b"abc"), "data:image/png;base64,YWJj");
    }

    #[tokio::test]
    async fn test_placeholder_provider() {
        let url = ImageProvider::placeholder().generate_image("love letter").await;
        assert!(url.starts_with("https://picsum.photos/400/600?random=7"));
    }

    #[tokio::test]
    async fn test_stock_provider() {
        let images = ImageProvider::stock();
        assert_eq!(
            images.generate_image("the town square at night").await,
            "https://images.pexels.com/photos/1105766/pexels-photo-1105766.jpeg"
        );
        assert_eq!(images.generate_image("a quiet cafe").await, STOCK_DEFAULT);
        assert_eq!(format!("{images:?}"), r#"ImageProvider { source: "stock" }"#);
    }
}
