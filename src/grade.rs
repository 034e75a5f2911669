use serde::{Deserialize, Serialize};

/// Coarse grade-level classification driving which tracks are offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeBucket {
    Middle,
    Highschool,
    HigherSecondary,
    College,
}

/// The six selectable assessment tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    Middle,
    Highschool,
    HigherSecondary,
    After10,
    After12,
    College,
}

pub const ALL_TRACKS: [Track; 6] = [
    Track::Middle,
    Track::Highschool,
    Track::HigherSecondary,
    Track::After10,
    Track::After12,
    Track::College,
];

impl Track {
    pub fn id(&self) -> &'static str {
        match self {
            Track::Middle => "middle",
            Track::Highschool => "highschool",
            Track::HigherSecondary => "higher_secondary",
            Track::After10 => "after10",
            Track::After12 => "after12",
            Track::College => "college",
        }
    }

    pub fn from_id(id: &str) -> Option<Track> {
        ALL_TRACKS.iter().copied().find(|t| t.id() == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub numeric_grade: Option<i64>,
    pub bucket: Option<GradeBucket>,
}

/// Map a raw stored grade string to a numeric grade and bucket.
///
/// Profiles hold whatever the enrolment form captured: "10th", "Grade 10",
/// "CLASS-10", sometimes just "10". The first integer substring decides;
/// decorations are ignored. Grades outside 6..=12 classify only via the
/// college flag.
pub fn classify(raw_grade: Option<&str>, is_college_student: bool) -> Classification {
    let numeric_grade = raw_grade.and_then(first_integer);
    let bucket = match numeric_grade {
        Some(6..=8) => Some(GradeBucket::Middle),
        Some(9..=10) => Some(GradeBucket::Highschool),
        Some(11..=12) => Some(GradeBucket::HigherSecondary),
        _ if is_college_student => Some(GradeBucket::College),
        _ => None,
    };
    Classification {
        numeric_grade,
        bucket,
    }
}

fn first_integer(text: &str) -> Option<i64> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|b| b.is_ascii_digit())?;
    let end = bytes[start..]
        .iter()
        .position(|b| !b.is_ascii_digit())
        .map(|i| start + i)
        .unwrap_or(bytes.len());
    text[start..end].parse().ok()
}

/// Track visibility rules, evaluated independently per track.
///
/// `months_in_grade == None` is optimistic: unknown duration never blocks a
/// progression option.
pub fn visible_tracks(
    bucket: Option<GradeBucket>,
    numeric_grade: Option<i64>,
    months_in_grade: Option<i64>,
    is_college_student: bool,
) -> Vec<Track> {
    let late = |grade: i64| numeric_grade == Some(grade) && months_in_grade.unwrap_or(0) >= 6;
    let progression_open =
        |grade: i64| numeric_grade == Some(grade) && months_in_grade.map_or(true, |m| m >= 6);

    let after12_open = bucket == Some(GradeBucket::HigherSecondary) && progression_open(12);

    let mut out = Vec::new();
    for track in ALL_TRACKS {
        let visible = match track {
            Track::Middle => bucket == Some(GradeBucket::Middle),
            Track::Highschool => {
                bucket == Some(GradeBucket::Highschool) && !late(10) && !late(12)
            }
            Track::HigherSecondary => bucket == Some(GradeBucket::HigherSecondary) && !late(12),
            Track::After10 => bucket == Some(GradeBucket::Highschool) && progression_open(10),
            Track::After12 => after12_open,
            Track::College => {
                is_college_student || bucket == Some(GradeBucket::College) || after12_open
            }
        };
        if visible {
            out.push(track);
        }
    }
    out
}
