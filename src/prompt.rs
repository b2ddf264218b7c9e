use emath::Pos2;

/// Label the decoder associates with a prompt record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum ClickType {
    /// Placeholder while a drag has not produced a box yet
    Pending,
    Ignored,
    Point,
    Box,
}

impl ClickType {
    pub fn label(self) -> f32 {
        i8::from(self) as f32
    }

    /// Whether the record takes part in box-range normalisation
    fn is_active(self) -> bool {
        !matches!(self, ClickType::Pending | ClickType::Ignored)
    }
}

impl From<ClickType> for i8 {
    fn from(value: ClickType) -> Self {
        match value {
            ClickType::Pending => -1,
            ClickType::Ignored => 0,
            ClickType::Point => 1,
            ClickType::Box => 2,
        }
    }
}

impl TryFrom<i8> for ClickType {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(ClickType::Pending),
            0 => Ok(ClickType::Ignored),
            1 => Ok(ClickType::Point),
            2 => Ok(ClickType::Box),
            x => Err(format!("Unknown click type {x}")),
        }
    }
}

/// A single prompt record in image pixel space.
///
/// When `width` and `height` are both present the record is a box: `(x, y)` is the
/// upper-left corner and `(width, height)` is the bottom-right corner, not a size.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Click {
    pub x: f32,
    pub y: f32,
    pub width: Option<f32>,
    pub height: Option<f32>,
    pub click_type: ClickType,
}

impl Click {
    pub fn point(pos: Pos2) -> Self {
        Self {
            x: pos.x,
            y: pos.y,
            width: None,
            height: None,
            click_type: ClickType::Point,
        }
    }

    /// Box from two arbitrary corners, stored with normalised corner order
    pub fn boxed(corners: BoxCorners) -> Self {
        let [upper_left, bottom_right] = corners.normalized();
        Self {
            x: upper_left.x,
            y: upper_left.y,
            width: Some(bottom_right.x),
            height: Some(bottom_right.y),
            click_type: ClickType::Box,
        }
    }

    pub fn pos(&self) -> Pos2 {
        Pos2::new(self.x, self.y)
    }

    /// Upper-left and bottom-right corners. A record with a single defined corner is no box.
    pub fn corners(&self) -> Option<[Pos2; 2]> {
        match (self.width, self.height) {
            (Some(x2), Some(y2)) => Some([self.pos(), Pos2::new(x2, y2)]),
            _ => None,
        }
    }

    pub fn is_box(&self) -> bool {
        self.corners().is_some()
    }
}

/// Box as the drag produced it: `start` is the drag origin, `end` the far corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxCorners {
    pub start: Pos2,
    pub end: Pos2,
}

impl BoxCorners {
    pub fn new(start: Pos2, end: Pos2) -> Self {
        Self { start, end }
    }

    pub fn normalized(&self) -> [Pos2; 2] {
        [self.start.min(self.end), self.start.max(self.end)]
    }

    /// Grows the box until it encloses `range`, never shrinking it.
    ///
    /// Edges are moved on whichever corner currently forms them, so the drag direction is kept.
    pub fn expand_to(&mut self, range: &PointRange) {
        let BoxCorners { start, end } = self;
        let min = start.min(*end);
        let max = start.max(*end);

        if range.min.x < min.x {
            if start.x < end.x {
                start.x = range.min.x;
            } else {
                end.x = range.min.x;
            }
        }
        if range.min.y < min.y {
            if start.y < end.y {
                start.y = range.min.y;
            } else {
                end.y = range.min.y;
            }
        }
        if range.max.x > max.x {
            if start.x > end.x {
                start.x = range.max.x;
            } else {
                end.x = range.max.x;
            }
        }
        if range.max.y > max.y {
            if start.y > end.y {
                start.y = range.max.y;
            } else {
                end.y = range.max.y;
            }
        }
    }
}

/// Bounding range of a group of point prompts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointRange {
    pub min: Pos2,
    pub max: Pos2,
}

impl PointRange {
    pub fn of<'a>(clicks: impl IntoIterator<Item = &'a Click>) -> Option<Self> {
        clicks
            .into_iter()
            .filter(|c| !c.is_box() && c.click_type.is_active())
            .map(Click::pos)
            .fold(None, |acc: Option<Self>, p| {
                Some(match acc {
                    Some(r) => Self {
                        min: r.min.min(p),
                        max: r.max.max(p),
                    },
                    None => Self { min: p, max: p },
                })
            })
    }
}

/// Prompt records for one inference call. A box, if present, occupies index 0.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct PromptSet(Vec<Click>);

impl PromptSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(click: Click) -> Self {
        Self(vec![click])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Click> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Click] {
        &self.0
    }

    /// Box record at index 0, if any
    pub fn box_click(&self) -> Option<&Click> {
        self.0.first().filter(|c| c.is_box())
    }

    /// All records following the box, or all records when there is none
    pub fn points(&self) -> &[Click] {
        match self.box_click() {
            Some(_) => &self.0[1..],
            None => &self.0,
        }
    }

    pub fn push(&mut self, click: Click) {
        debug_assert!(!click.is_box(), "Boxes are placed with `with_box`");
        self.0.push(click);
    }

    /// New set with `click` placed as the box, replacing the existing one
    pub fn with_box(&self, click: Click) -> Self {
        let mut clicks = self.0.clone();
        match clicks.first() {
            Some(first) if first.is_box() => clicks[0] = click,
            _ => clicks.insert(0, click),
        }
        Self(clicks)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl<'a> IntoIterator for &'a PromptSet {
    type Item = &'a Click;
    type IntoIter = std::slice::Iter<'a, Click>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Click> for PromptSet {
    fn from_iter<T: IntoIterator<Item = Click>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
