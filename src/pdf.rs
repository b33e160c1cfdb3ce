use crate::workflow::WorkflowSnapshot;
use anyhow::Context;
use bytes::Bytes;
use owned_ttf_parser::Face;
use printpdf::*;
use std::collections::BTreeSet;
use std::io::BufWriter;
use std::path::Path;
use tracing::{info, warn};

const LINE_CHARS: usize = 95;

/// Common install locations of TrueType fonts with CJK coverage, tried when
/// `PDF_FONT_PATH` is unset.
const SYSTEM_FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/droid/DroidSansFallbackFull.ttf",
    "/System/Library/Fonts/Supplemental/Arial Unicode.ttf",
    "/Library/Fonts/Arial Unicode.ttf",
    "C:\\Windows\\Fonts\\simhei.ttf",
];

/// Font for localized copy in the brief. Fixed English labels always use the
/// builtin Helvetica faces.
#[derive(Debug, Clone)]
pub struct BriefFont {
    source: FontSource,
}

#[derive(Debug, Clone)]
enum FontSource {
    Embedded { origin: String, bytes: Bytes },
    /// Builtin Helvetica, WinAnsi encoded.
    Builtin,
}

impl BriefFont {
    pub fn builtin() -> Self {
        Self { source: FontSource::Builtin }
    }

    pub fn from_bytes(origin: impl Into<String>, bytes: impl Into<Bytes>) -> anyhow::Result<Self> {
        let origin = origin.into();
        let bytes = bytes.into();
        Face::parse(&bytes, 0).map_err(|e| anyhow::anyhow!("{origin} is not a usable font: {e:?}"))?;
        Ok(Self { source: FontSource::Embedded { origin, bytes } })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("reading font {}", path.display()))?;
        Self::from_bytes(path.display().to_string(), bytes)
    }

    /// The configured font, else the first usable system font, else builtin.
    pub fn discover(configured: Option<&Path>) -> Self {
        if let Some(path) = configured {
            match Self::load(path) {
                Ok(font) => {
                    info!("🔤 PDF font: {}", path.display());
                    return font;
                }
                Err(e) => warn!("⚠️ PDF_FONT_PATH ignored: {:#}", e),
            }
        }
        for candidate in SYSTEM_FONT_CANDIDATES {
            let path = Path::new(candidate);
            if path.is_file() {
                if let Ok(font) = Self::load(path) {
                    info!("🔤 PDF font: {} (system)", path.display());
                    return font;
                }
            }
        }
        warn!("⚠️ No Unicode font found; PDF briefs only render Latin-1 copy. Set PDF_FONT_PATH to a CJK TTF");
        Self::builtin()
    }

    pub fn origin(&self) -> &str {
        match &self.source {
            FontSource::Embedded { origin, .. } => origin,
            FontSource::Builtin => "builtin Helvetica",
        }
    }

    /// Distinct non-whitespace characters of `text` this font has no glyph for.
    pub fn missing_chars(&self, text: &str) -> Vec<char> {
        let drawable = text.chars().filter(|c| !c.is_whitespace());
        let missing: BTreeSet<char> = match &self.source {
            FontSource::Embedded { bytes, .. } => match Face::parse(bytes, 0) {
                Ok(face) => drawable.filter(|c| face.glyph_index(*c).is_none()).collect(),
                Err(_) => drawable.collect(),
            },
            FontSource::Builtin => drawable.filter(|c| !is_win_ansi(*c)).collect(),
        };
        missing.into_iter().collect()
    }
}

fn is_win_ansi(c: char) -> bool {
    c.is_ascii() || ('\u{a0}'..='\u{ff}').contains(&c) || "€‚ƒ„…†‡ˆ‰Š‹ŒŽ‘’“”•–—˜™š›œžŸ".contains(c)
}

/// Storyboard brief: a summary page, then one page per scene.
/// Generated images are not embedded.
pub fn generate_pdf(snapshot: &WorkflowSnapshot, brief_font: &BriefFont) -> anyhow::Result<Vec<u8>> {
    let (doc, page, layer) = PdfDocument::new("Product Detail Storyboard", Mm(210.0), Mm(297.0), "Summary");
    let font = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| anyhow::anyhow!("font: {e:?}"))?;
    let bold = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(|e| anyhow::anyhow!("font: {e:?}"))?;
    let body = match &brief_font.source {
        FontSource::Embedded { bytes, .. } => doc
            .add_external_font(&bytes[..])
            .map_err(|e| anyhow::anyhow!("font {}: {e:?}", brief_font.origin()))?,
        FontSource::Builtin => font.clone(),
    };

    let missing = brief_font.missing_chars(&localized_text(snapshot));
    if !missing.is_empty() {
        warn!(
            "⚠️ {} has no glyphs for {} characters ({}), they are left out of the brief",
            brief_font.origin(),
            missing.len(),
            missing.iter().take(12).collect::<String>()
        );
    }

    let summary = doc.get_page(page).get_layer(layer);
    summary.use_text("Product Detail Storyboard", 20.0, Mm(15.0), Mm(275.0), &bold);
    summary.use_text(truncate(&snapshot.base_prompt, 140), 11.0, Mm(15.0), Mm(262.0), &body);
    summary.use_text(format!("Market language: {}", snapshot.target_language), 10.0, Mm(15.0), Mm(252.0), &font);

    let mut y = 240.0;
    if let Some(analysis) = &snapshot.analysis {
        summary.use_text("Colours", 10.0, Mm(15.0), Mm(y), &bold);
        summary.use_text(
            format!(
                "main {} / secondary {} / background {}",
                analysis.main_color, analysis.secondary_color, analysis.background_color
            ),
            10.0,
            Mm(45.0),
            Mm(y),
            &font,
        );
        y -= 6.0;
        for (label, value) in [
            ("Category", analysis.category.clone()),
            ("Material", analysis.material.clone()),
            ("Features", analysis.features.join(", ")),
            ("Style", analysis.style_keywords.join(", ")),
        ] {
            summary.use_text(label, 10.0, Mm(15.0), Mm(y), &bold);
            for line in wrap(&value, LINE_CHARS - 20) {
                summary.use_text(line, 10.0, Mm(45.0), Mm(y), &body);
                y -= 6.0;
            }
        }
    }
    let rendered = snapshot.storyboard.iter().filter(|i| i.generated_image_url.is_some()).count();
    summary.use_text(
        format!("{} scenes, {} rendered (images not embedded)", snapshot.storyboard.len(), rendered),
        8.0,
        Mm(15.0),
        Mm(y - 4.0),
        &font,
    );

    for item in &snapshot.storyboard {
        let (page, layer) = doc.add_page(Mm(210.0), Mm(297.0), format!("Scene {}", item.id));
        let layer_ref = doc.get_page(page).get_layer(layer);
        layer_ref.use_text(format!("{}. {}", item.id, item.role.label()), 16.0, Mm(15.0), Mm(275.0), &bold);
        layer_ref.use_text(truncate(&item.title, 80), 14.0, Mm(15.0), Mm(266.0), &body);
        let mut y = 254.0;
        for (heading, text) in [
            ("Overlay", item.overlay_text.as_str()),
            ("Scene", item.description.as_str()),
            ("Visual prompt", item.visual_prompt.as_str()),
        ] {
            layer_ref.use_text(heading, 10.0, Mm(15.0), Mm(y), &bold);
            y -= 6.0;
            for line in wrap(text, LINE_CHARS) {
                layer_ref.use_text(line, 9.0, Mm(15.0), Mm(y), &body);
                y -= 5.0;
            }
            y -= 4.0;
        }
    }

    let mut buf: Vec<u8> = Vec::new();
    {
        let mut writer = BufWriter::new(&mut buf);
        doc.save(&mut writer).map_err(|e| anyhow::anyhow!("save: {e:?}"))?;
    }
    Ok(buf)
}

/// Everything drawn with the localized font.
fn localized_text(snapshot: &WorkflowSnapshot) -> String {
    let mut text = snapshot.base_prompt.clone();
    if let Some(analysis) = &snapshot.analysis {
        text.push_str(&analysis.category);
        text.push_str(&analysis.material);
        text.push_str(&analysis.features.concat());
        text.push_str(&analysis.style_keywords.concat());
    }
    for item in &snapshot.storyboard {
        for part in [&item.title, &item.overlay_text, &item.description, &item.visual_prompt] {
            text.push_str(part);
        }
    }
    text
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(max).collect::<String>())
    }
}

/// Greedy word wrap on character count.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}
