//! Shape kinds and the hydration factory.
//!
//! A shape description is a JSON object carrying a `"type"` discriminant and
//! a flat set of attributes (`left`, `top`, `width`, `height`, `angle`,
//! `scaleX`, `scaleY`, `zIndex`, `parentId`, plus kind-specific fields).
//! [`hydrate`] is the single entry point that turns one into a [`Shape`];
//! the set of kinds is closed, so an unknown discriminant is a typed error
//! rather than a silently skipped object.

use crate::object::ObjectId;
use crate::{Point, Rect};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HydrationError {
    #[error("shape description has no \"type\" discriminant")]
    MissingKind,
    #[error("unknown shape kind: {0}")]
    UnknownKind(String),
    #[error("malformed shape description: {0}")]
    Malformed(String),
}

/// Closed set of shape kinds the surface knows how to materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Rect,
    Ellipse,
    Triangle,
    Line,
    Path,
    Text,
    Image,
    Group,
}

impl ShapeKind {
    /// Look up a kind by its wire discriminant.
    ///
    /// `circle`, `textbox` and `i-text` are accepted as aliases since editors
    /// in the wild emit them for the same primitives.
    pub fn from_discriminant(tag: &str) -> Option<Self> {
        Some(match tag {
            "rect" => ShapeKind::Rect,
            "ellipse" | "circle" => ShapeKind::Ellipse,
            "triangle" => ShapeKind::Triangle,
            "line" => ShapeKind::Line,
            "path" => ShapeKind::Path,
            "text" | "textbox" | "i-text" => ShapeKind::Text,
            "image" => ShapeKind::Image,
            "group" => ShapeKind::Group,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShapeKind::Rect => "rect",
            ShapeKind::Ellipse => "ellipse",
            ShapeKind::Triangle => "triangle",
            ShapeKind::Line => "line",
            ShapeKind::Path => "path",
            ShapeKind::Text => "text",
            ShapeKind::Image => "image",
            ShapeKind::Group => "group",
        }
    }

    /// Attribute that must be present for this kind, if any.
    fn required_field(&self) -> Option<&'static str> {
        match self {
            ShapeKind::Path => Some("path"),
            ShapeKind::Text => Some("text"),
            ShapeKind::Image => Some("src"),
            _ => None,
        }
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placement attributes. Rotation is in degrees around the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
    pub angle: f32,
    pub scale_x: f32,
    pub scale_y: f32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            left: 0.0,
            top: 0.0,
            width: 0.0,
            height: 0.0,
            angle: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
        }
    }
}

impl Geometry {
    /// Axis-aligned bounding box of the scaled, rotated shape.
    pub fn bounds(&self) -> Rect {
        let w = self.width * self.scale_x.abs();
        let h = self.height * self.scale_y.abs();
        let (sin, cos) = self.angle.to_radians().sin_cos();
        let corner = |x: f32, y: f32| Point {
            x: self.left + x * cos - y * sin,
            y: self.top + x * sin + y * cos,
        };
        Rect::enclosing(&[corner(0.0, 0.0), corner(w, 0.0), corner(0.0, h), corner(w, h)])
    }
}

/// A hydrated, renderable shape.
///
/// `properties` is the full description the shape was built from; every other
/// field is derived from it and recomputed on [`Shape::merge`].
#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    pub kind: ShapeKind,
    pub geometry: Geometry,
    pub z_index: i64,
    pub parent_id: Option<ObjectId>,
    pub bounds: Rect,
    properties: Map<String, Value>,
}

impl Shape {
    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// The description this shape would serialize back to.
    pub fn to_description(&self) -> Value {
        Value::Object(self.properties.clone())
    }

    /// Merge a change set into the shape and recompute derived geometry.
    ///
    /// A `null` value removes the attribute. On error the shape is unchanged.
    pub fn merge(&mut self, changes: &Value) -> Result<(), HydrationError> {
        let patch = match changes {
            Value::Null => return Ok(()),
            Value::Object(map) => map,
            other => {
                return Err(HydrationError::Malformed(format!(
                    "changes must be an object, got {}",
                    json_type(other)
                )))
            }
        };

        let mut merged = self.properties.clone();
        for (key, value) in patch {
            if value.is_null() {
                merged.remove(key);
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }
        *self = from_properties(merged)?;
        Ok(())
    }
}

/// Build a [`Shape`] from a serialized description.
pub fn hydrate(description: &Value) -> Result<Shape, HydrationError> {
    match description {
        Value::Object(map) => from_properties(map.clone()),
        other => Err(HydrationError::Malformed(format!(
            "description must be an object, got {}",
            json_type(other)
        ))),
    }
}

/// Parse JSON text (a persisted `shape_data` column) and hydrate it.
pub fn hydrate_str(shape_data: &str) -> Result<Shape, HydrationError> {
    let value: Value =
        serde_json::from_str(shape_data).map_err(|e| HydrationError::Malformed(e.to_string()))?;
    hydrate(&value)
}

fn from_properties(properties: Map<String, Value>) -> Result<Shape, HydrationError> {
    let tag = match properties.get("type") {
        None | Some(Value::Null) => return Err(HydrationError::MissingKind),
        Some(Value::String(tag)) => tag,
        Some(other) => {
            return Err(HydrationError::Malformed(format!(
                "\"type\" must be a string, got {}",
                json_type(other)
            )))
        }
    };
    let kind = ShapeKind::from_discriminant(tag)
        .ok_or_else(|| HydrationError::UnknownKind(tag.clone()))?;

    if let Some(field) = kind.required_field() {
        if !properties.contains_key(field) {
            return Err(HydrationError::Malformed(format!(
                "{kind} requires \"{field}\""
            )));
        }
    }
    if kind == ShapeKind::Group {
        if let Some(children) = properties.get("objects") {
            if !children.is_array() {
                return Err(HydrationError::Malformed("group \"objects\" must be an array".into()));
            }
        }
    }

    let geometry = Geometry {
        left: number(&properties, "left", 0.0)?,
        top: number(&properties, "top", 0.0)?,
        width: extent(&properties, "width")?,
        height: extent(&properties, "height")?,
        angle: number(&properties, "angle", 0.0)?,
        scale_x: number(&properties, "scaleX", 1.0)?,
        scale_y: number(&properties, "scaleY", 1.0)?,
    };

    let z_index = match properties.get("zIndex") {
        None | Some(Value::Null) => 0,
        Some(v) => v
            .as_i64()
            .or_else(|| v.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .ok_or_else(|| HydrationError::Malformed("\"zIndex\" must be a number".into()))?,
    };

    let parent_id = match properties.get("parentId") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(
            s.parse::<ObjectId>()
                .map_err(|e| HydrationError::Malformed(format!("\"parentId\": {e}")))?,
        ),
        Some(_) => return Err(HydrationError::Malformed("\"parentId\" must be a string".into())),
    };

    Ok(Shape {
        kind,
        bounds: geometry.bounds(),
        geometry,
        z_index,
        parent_id,
        properties,
    })
}

fn number(map: &Map<String, Value>, key: &str, default: f32) -> Result<f32, HydrationError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_f64()
            .filter(|f| f.is_finite())
            .map(|f| f as f32)
            .ok_or_else(|| HydrationError::Malformed(format!("\"{key}\" must be a finite number"))),
    }
}

fn extent(map: &Map<String, Value>, key: &str) -> Result<f32, HydrationError> {
    let value = number(map, key, 0.0)?;
    if value < 0.0 {
        return Err(HydrationError::Malformed(format!("\"{key}\" is negative")));
    }
    Ok(value)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
