use std::collections::BTreeMap;

use common::{ClientPreference, Track};

/// Sources in these formats are re-encoded unless the client names a format.
pub const LOSSLESS_FORMATS: &[&str] = &["flac", "wav", "ape", "wv", "aiff", "aif"];
pub const LOSSLESS_TARGET_FORMAT: &str = "ogg";
pub const LOSSLESS_TARGET_BITRATE: u32 = 320;

const RAW_FORMAT: &str = "raw";
const FALLBACK_MIME: &str = "application/octet-stream";

/// Per-request stream parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamRequest {
    /// kbps, `Some(0)` means unlimited
    pub max_bitrate: Option<u32>,
    /// Lowercased output format or `raw`.
    pub format: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub src_format: String,
    pub dst_format: String,
    /// kbps
    pub dst_bitrate: u32,
    pub transcode: bool,
    pub mime: String,
}

/// One external process. Every stage after the first reads the previous
/// stage's standard output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stage {
    pub argv: Vec<String>,
}

impl Stage {
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineSpec {
    pub stages: Vec<Stage>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plan {
    pub mime: String,
    pub format: String,
    /// kbps
    pub bitrate: u32,
    /// `None` serves the file as stored.
    pub pipeline: Option<PipelineSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    NoTranscoder { src: String, dst: String },
    UnterminatedQuote(String),
    EmptyStage(String),
}

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanError::NoTranscoder { src, dst } => {
                write!(f, "No way to transcode from {} to {}", src, dst)
            }
            PlanError::UnterminatedQuote(template) => {
                write!(f, "unterminated quote in command template: {}", template)
            }
            PlanError::EmptyStage(template) => {
                write!(f, "empty command in template: {}", template)
            }
        }
    }
}

impl std::error::Error for PlanError {}

pub fn mime_for_format(format: &str) -> String {
    mime_guess::from_ext(format)
        .first()
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| FALLBACK_MIME.to_string())
}

pub fn is_lossless(format: &str) -> bool {
    LOSSLESS_FORMATS.contains(&format)
}

/// Works out the output format and bitrate. Each step can only switch
/// transcoding on; a later step may still change the target it picked.
pub fn decide(
    src_format: &str,
    src_bitrate: u32,
    request: &StreamRequest,
    prefs: Option<&ClientPreference>,
) -> Decision {
    let src_format = src_format.to_ascii_lowercase();
    let mut dst_format = src_format.clone();
    let mut dst_bitrate = src_bitrate;
    let mut transcode = false;

    if let Some(max) = request.max_bitrate {
        if max != 0 && max < dst_bitrate {
            transcode = true;
            dst_bitrate = max;
        }
    }

    let requested_format = request
        .format
        .as_deref()
        .map(str::trim)
        .filter(|format| !format.is_empty());
    if let Some(format) = requested_format {
        if format != RAW_FORMAT && format != src_format {
            transcode = true;
            dst_format = format.to_string();
        }
    }

    if let Some(prefs) = prefs {
        if requested_format != Some(RAW_FORMAT) {
            if let Some(format) = prefs.format.as_deref().filter(|f| !f.is_empty()) {
                dst_format = format.to_ascii_lowercase();
                if dst_format != src_format {
                    transcode = true;
                }
            }
        }
        if let Some(bitrate) = prefs.bitrate.filter(|b| *b > 0) {
            if bitrate < dst_bitrate {
                dst_bitrate = bitrate;
                transcode = true;
            }
        }
    }

    if requested_format.is_none() && is_lossless(&src_format) {
        dst_format = LOSSLESS_TARGET_FORMAT.to_string();
        dst_bitrate = LOSSLESS_TARGET_BITRATE;
        transcode = true;
    }

    let mime = mime_for_format(&dst_format);
    Decision {
        src_format,
        dst_format,
        dst_bitrate,
        transcode,
        mime,
    }
}

/// Decides how `track` is served and, when it must be transcoded, builds
/// the process pipeline from the configured templates.
pub fn plan(
    track: &Track,
    request: &StreamRequest,
    prefs: Option<&ClientPreference>,
    templates: &BTreeMap<String, String>,
) -> Result<Plan, PlanError> {
    let decision = decide(&track.suffix(), track.bitrate, request, prefs);
    if !decision.transcode {
        return Ok(Plan {
            mime: mime_for_format(&decision.src_format),
            format: decision.src_format,
            bitrate: decision.dst_bitrate,
            pipeline: None,
        });
    }

    let pipeline = build_pipeline(
        templates,
        &track.path,
        &decision.src_format,
        &decision.dst_format,
        decision.dst_bitrate,
    )?;
    Ok(Plan {
        mime: decision.mime,
        format: decision.dst_format,
        bitrate: decision.dst_bitrate,
        pipeline: Some(pipeline),
    })
}

/// Template lookup order: `transcoder_<src>_<dst>`, then the
/// `decoder_<src>|decoder` + `encoder_<dst>|encoder` pair, then the generic
/// `transcoder`.
pub fn build_pipeline(
    templates: &BTreeMap<String, String>,
    src_path: &str,
    src_format: &str,
    dst_format: &str,
    bitrate: u32,
) -> Result<PipelineSpec, PlanError> {
    let lookup = |key: &str| {
        templates
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    };

    let direct = lookup(&format!("transcoder_{}_{}", src_format, dst_format));
    let decoder = lookup(&format!("decoder_{}", src_format)).or_else(|| lookup("decoder"));
    let encoder = lookup(&format!("encoder_{}", dst_format)).or_else(|| lookup("encoder"));

    let subst = Substitutions {
        src_path,
        src_format,
        dst_format,
        bitrate,
    };

    if let Some(template) = direct {
        return parse_template(template, &subst);
    }
    if let (Some(decoder), Some(encoder)) = (decoder, encoder) {
        let mut stages = parse_template(decoder, &subst)?.stages;
        stages.extend(parse_template(encoder, &subst)?.stages);
        return Ok(PipelineSpec { stages });
    }
    if let Some(template) = lookup("transcoder") {
        return parse_template(template, &subst);
    }
    Err(PlanError::NoTranscoder {
        src: src_format.to_string(),
        dst: dst_format.to_string(),
    })
}

struct Substitutions<'a> {
    src_path: &'a str,
    src_format: &'a str,
    dst_format: &'a str,
    bitrate: u32,
}

impl Substitutions<'_> {
    // %srcpath goes last so a path containing placeholder text stays intact.
    fn apply(&self, word: &str) -> String {
        word.replace("%srcfmt", self.src_format)
            .replace("%outfmt", self.dst_format)
            .replace("%outrate", &self.bitrate.to_string())
            .replace("%srcpath", self.src_path)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Pipe,
}

/// Splits a template into stages on unquoted `|`, then substitutes
/// placeholders inside each argument so a substituted value is always
/// exactly one argument.
fn parse_template(template: &str, subst: &Substitutions<'_>) -> Result<PipelineSpec, PlanError> {
    let tokens = tokenize(template)?;
    let mut stages = Vec::new();
    let mut argv = Vec::new();
    for token in tokens {
        match token {
            Token::Word(word) => argv.push(subst.apply(&word)),
            Token::Pipe => {
                if argv.is_empty() {
                    return Err(PlanError::EmptyStage(template.to_string()));
                }
                stages.push(Stage {
                    argv: std::mem::take(&mut argv),
                });
            }
        }
    }
    if argv.is_empty() {
        return Err(PlanError::EmptyStage(template.to_string()));
    }
    stages.push(Stage { argv });
    Ok(PipelineSpec { stages })
}

fn tokenize(template: &str) -> Result<Vec<Token>, PlanError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = template.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(PlanError::UnterminatedQuote(template.to_string())),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => {
                                return Err(PlanError::UnterminatedQuote(template.to_string()))
                            }
                        },
                        Some(c) => current.push(c),
                        None => return Err(PlanError::UnterminatedQuote(template.to_string())),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(c) = chars.next() {
                    current.push(c);
                }
            }
            '|' => {
                if in_word {
                    tokens.push(Token::Word(std::mem::take(&mut current)));
                    in_word = false;
                }
                tokens.push(Token::Pipe);
            }
            c if c.is_whitespace() => {
                if in_word {
                    tokens.push(Token::Word(std::mem::take(&mut current)));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        tokens.push(Token::Word(current));
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn templates(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn track(path: &str, bitrate: u32) -> Track {
        Track {
            id: "t".to_string(),
            path: path.to_string(),
            folder_id: "f".to_string(),
            album_id: "a".to_string(),
            disc: None,
            number: None,
            title: "t".to_string(),
            year: None,
            genre: None,
            artist: "a".to_string(),
            bitrate,
            duration: 200,
            last_modification: 0,
            created: 0,
            play_count: 0,
            last_play: None,
        }
    }

    fn request(max_bitrate: Option<u32>, format: Option<&str>) -> StreamRequest {
        StreamRequest {
            max_bitrate,
            format: format.map(str::to_string),
        }
    }

    fn argvs(spec: &PipelineSpec) -> Vec<Vec<&str>> {
        spec.stages
            .iter()
            .map(|stage| stage.argv.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn lossless_source_is_forced_to_lossy_default() {
        let decision = decide("flac", 900, &request(None, None), None);
        assert!(decision.transcode);
        assert_eq!(decision.dst_format, LOSSLESS_TARGET_FORMAT);
        assert_eq!(decision.dst_bitrate, LOSSLESS_TARGET_BITRATE);
        assert_eq!(decision.mime, "audio/ogg");
    }

    #[test]
    fn higher_cap_than_source_keeps_raw_file() {
        let decision = decide("mp3", 128, &request(Some(320), None), None);
        assert!(!decision.transcode);
        assert_eq!(decision.dst_bitrate, 128);
        assert_eq!(decision.dst_format, "mp3");
    }

    #[test]
    fn lower_cap_than_source_transcodes_same_format() {
        let decision = decide("mp3", 320, &request(Some(128), None), None);
        assert!(decision.transcode);
        assert_eq!(decision.dst_bitrate, 128);
        assert_eq!(decision.dst_format, "mp3");
        assert_eq!(decision.mime, "audio/mpeg");
    }

    #[test]
    fn zero_cap_means_unlimited() {
        let decision = decide("mp3", 320, &request(Some(0), None), None);
        assert!(!decision.transcode);
    }

    #[test]
    fn explicit_format_disables_lossless_policy() {
        let decision = decide("flac", 900, &request(None, Some("raw")), None);
        assert!(!decision.transcode);
        assert_eq!(decision.dst_format, "flac");

        let decision = decide("flac", 900, &request(None, Some("mp3")), None);
        assert!(decision.transcode);
        assert_eq!(decision.dst_format, "mp3");
        assert_eq!(decision.dst_bitrate, 900);
    }

    #[test]
    fn same_format_request_is_not_a_transcode() {
        let decision = decide("mp3", 192, &request(None, Some("mp3")), None);
        assert!(!decision.transcode);
    }

    #[test]
    fn client_preferences_override_target() {
        let prefs = ClientPreference {
            user_id: "u".to_string(),
            client_name: "c".to_string(),
            format: Some("opus".to_string()),
            bitrate: Some(96),
        };
        let decision = decide("mp3", 320, &request(Some(192), None), Some(&prefs));
        assert!(decision.transcode);
        assert_eq!(decision.dst_format, "opus");
        assert_eq!(decision.dst_bitrate, 96);

        let decision = decide("mp3", 320, &request(None, Some("raw")), Some(&prefs));
        assert_eq!(decision.dst_format, "mp3");
        assert_eq!(decision.dst_bitrate, 96);
        assert!(decision.transcode);
    }

    #[test]
    fn higher_preferred_bitrate_is_ignored() {
        let prefs = ClientPreference {
            user_id: "u".to_string(),
            client_name: "c".to_string(),
            format: None,
            bitrate: Some(320),
        };
        let decision = decide("mp3", 128, &request(None, None), Some(&prefs));
        assert!(!decision.transcode);
        assert_eq!(decision.dst_bitrate, 128);
    }

    #[test]
    fn combined_template_splits_on_pipe() {
        let templates = templates(&[(
            "transcoder_flac_mp3",
            "flac -d -c %srcpath   |   lame -b %outrate - -",
        )]);
        let spec = build_pipeline(&templates, "/m/a b.flac", "flac", "mp3", 192).unwrap();
        assert_eq!(
            argvs(&spec),
            vec![
                vec!["flac", "-d", "-c", "/m/a b.flac"],
                vec!["lame", "-b", "192", "-", "-"],
            ]
        );
    }

    #[test]
    fn quoted_pipe_stays_an_argument() {
        let templates = templates(&[("transcoder", "sh -c 'cat %srcpath | gzip'")]);
        let spec = build_pipeline(&templates, "/m/x.mp3", "mp3", "ogg", 128).unwrap();
        assert_eq!(argvs(&spec), vec![vec!["sh", "-c", "cat /m/x.mp3 | gzip"]]);
    }

    #[test]
    fn decoder_encoder_pair_beats_generic_transcoder() {
        let templates = templates(&[
            ("decoder_flac", "flac -d -c %srcpath"),
            ("encoder", "oggenc -b %outrate -o - -"),
            ("transcoder", "ffmpeg -i %srcpath -f %outfmt -"),
        ]);
        let spec = build_pipeline(&templates, "/m/x.flac", "flac", "ogg", 320).unwrap();
        assert_eq!(
            argvs(&spec),
            vec![
                vec!["flac", "-d", "-c", "/m/x.flac"],
                vec!["oggenc", "-b", "320", "-o", "-", "-"],
            ]
        );

        let spec = build_pipeline(&templates, "/m/x.wav", "wav", "ogg", 320).unwrap();
        assert_eq!(
            argvs(&spec),
            vec![vec!["ffmpeg", "-i", "/m/x.wav", "-f", "ogg", "-"]]
        );
    }

    #[test]
    fn direct_transcoder_beats_everything() {
        let templates = templates(&[
            ("transcoder_mp3_ogg", "sox %srcpath -t %outfmt -"),
            ("decoder", "ffmpeg -i %srcpath -f wav -"),
            ("encoder", "ffmpeg -i - -f %outfmt -"),
        ]);
        let spec = build_pipeline(&templates, "/m/x.mp3", "mp3", "ogg", 128).unwrap();
        assert_eq!(argvs(&spec), vec![vec!["sox", "/m/x.mp3", "-t", "ogg", "-"]]);
    }

    #[test]
    fn path_with_placeholder_text_is_not_rewritten() {
        let templates = templates(&[("transcoder", "conv %srcpath %outfmt")]);
        let spec = build_pipeline(&templates, "/m/%outfmt \"x\".mp3", "mp3", "ogg", 128).unwrap();
        assert_eq!(argvs(&spec), vec![vec!["conv", "/m/%outfmt \"x\".mp3", "ogg"]]);
    }

    #[test]
    fn missing_templates_fail_planning() {
        let templates = templates(&[("decoder", "ffmpeg -i %srcpath -f wav -")]);
        let err = build_pipeline(&templates, "/m/x.flac", "flac", "ogg", 320).unwrap_err();
        assert_eq!(
            err,
            PlanError::NoTranscoder {
                src: "flac".to_string(),
                dst: "ogg".to_string()
            }
        );
        assert_eq!(err.to_string(), "No way to transcode from flac to ogg");
    }

    #[test]
    fn malformed_templates_are_rejected() {
        let unterminated = templates(&[("transcoder", "sox \"%srcpath -")]);
        assert!(matches!(
            build_pipeline(&unterminated, "/m/x", "mp3", "ogg", 1),
            Err(PlanError::UnterminatedQuote(_))
        ));
        let dangling = templates(&[("transcoder", "sox %srcpath |")]);
        assert!(matches!(
            build_pipeline(&dangling, "/m/x", "mp3", "ogg", 1),
            Err(PlanError::EmptyStage(_))
        ));
    }

    #[test]
    fn plan_serves_raw_when_nothing_forces_transcoding() {
        let plan = plan(
            &track("/m/a.mp3", 192),
            &request(None, None),
            None,
            &BTreeMap::new(),
        )
        .unwrap();
        assert!(plan.pipeline.is_none());
        assert_eq!(plan.mime, "audio/mpeg");
        assert_eq!(plan.format, "mp3");
    }

    #[test]
    fn plan_builds_pipeline_for_lossless() {
        let templates = templates(&[
            ("decoder", "ffmpeg -v quiet -i %srcpath -f wav -"),
            ("encoder", "ffmpeg -v quiet -f wav -i - -f %outfmt -b:a %outratek -"),
        ]);
        let plan = plan(&track("/m/A B/01.FLAC", 900), &request(None, None), None, &templates)
            .unwrap();
        assert_eq!(plan.format, "ogg");
        assert_eq!(plan.bitrate, 320);
        let spec = plan.pipeline.unwrap();
        assert_eq!(spec.stages.len(), 2);
        assert_eq!(spec.stages[0].argv[4], "/m/A B/01.FLAC");
        assert_eq!(spec.stages[1].argv[10], "320k");
        assert_eq!(spec.stages[1].program(), "ffmpeg");
    }
}
