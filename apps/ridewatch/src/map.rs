//! Inputs for a map widget: markers, the connecting line and viewport framing.
//!
//! Coordinates handed to `geo` are `x = longitude`, `y = latitude`.

use geo::{coord, Line, Point, Rect};
use shared::{LatLng, Role};

pub const FIT_PADDING_PX: u32 = 70;
pub const SINGLE_POINT_ZOOM: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Vehicle,
    Destination,
}

impl MarkerKind {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Tracker => MarkerKind::Vehicle,
            Role::Observer => MarkerKind::Destination,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Marker {
    pub kind: MarkerKind,
    pub position: Point<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Framing {
    FitBounds { bounds: Rect<f64>, padding_px: u32 },
    FlyTo { center: Point<f64>, zoom: u8 },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MapScene {
    pub local: Option<Marker>,
    pub counterpart: Option<Marker>,
    pub route: Option<Line<f64>>,
    pub framing: Option<Framing>,
}

fn point(p: LatLng) -> Point<f64> {
    Point::new(p.lon, p.lat)
}

impl MapScene {
    pub fn from_positions(role: Role, local: Option<LatLng>, counterpart: Option<LatLng>) -> Self {
        let local_marker = local.map(|p| Marker {
            kind: MarkerKind::for_role(role),
            position: point(p),
        });
        let counterpart_marker = counterpart.map(|p| Marker {
            kind: MarkerKind::for_role(role.counterpart()),
            position: point(p),
        });

        let (route, framing) = match (local, counterpart) {
            (Some(a), Some(b)) => (
                Some(Line::new(coord! { x: a.lon, y: a.lat }, coord! { x: b.lon, y: b.lat })),
                Some(Framing::FitBounds {
                    bounds: Rect::new(coord! { x: a.lon, y: a.lat }, coord! { x: b.lon, y: b.lat }),
                    padding_px: FIT_PADDING_PX,
                }),
            ),
            (Some(a), None) => (
                None,
                Some(Framing::FlyTo {
                    center: point(a),
                    zoom: SINGLE_POINT_ZOOM,
                }),
            ),
            _ => (None, None),
        };

        Self {
            local: local_marker,
            counterpart: counterpart_marker,
            route,
            framing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_points_fit_bounds_with_line() {
        let rider = LatLng::new(24.9142, 67.1245);
        let home = LatLng::new(24.9200, 67.1300);
        let scene = MapScene::from_positions(Role::Observer, Some(home), Some(rider));

        assert_eq!(scene.local.unwrap().kind, MarkerKind::Destination);
        assert_eq!(scene.counterpart.unwrap().kind, MarkerKind::Vehicle);
        assert!(scene.route.is_some());
        let Some(Framing::FitBounds { bounds, padding_px }) = scene.framing else {
            panic!("expected fit bounds");
        };
        assert_eq!(padding_px, 70);
        assert_eq!(bounds.min(), coord! { x: 67.1245, y: 24.9142 });
        assert_eq!(bounds.max(), coord! { x: 67.1300, y: 24.9200 });
    }

    #[test]
    fn only_local_flies_to_it() {
        let scene = MapScene::from_positions(Role::Tracker, Some(LatLng::new(1.0, 2.0)), None);
        assert_eq!(scene.local.unwrap().kind, MarkerKind::Vehicle);
        assert_eq!(
            scene.framing,
            Some(Framing::FlyTo {
                center: Point::new(2.0, 1.0),
                zoom: 16
            })
        );
        assert!(scene.route.is_none());
    }

    #[test]
    fn only_counterpart_does_not_reframe() {
        let scene = MapScene::from_positions(Role::Observer, None, Some(LatLng::new(1.0, 2.0)));
        assert!(scene.counterpart.is_some());
        assert_eq!(scene.framing, None);
    }
}
