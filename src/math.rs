//! Small geometry helpers shared by the front- and back-end.

/// Map an NDC position to viewport pixels. NDC y points up, screen y down.
pub fn ndc_to_viewport(ndc_x: f32, ndc_y: f32, width: f32, height: f32) -> (f32, f32) {
    (
        ndc_x * width / 2. + width / 2.,
        -ndc_y * height / 2. + height / 2.,
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Size<T> {
    pub width: T,
    pub height: T,
}

impl<T> Size<T> {
    pub fn new(width: T, height: T) -> Self {
        Size { width, height }
    }
}

/// Inclusive pixel rectangle; `x1 < x0` encodes the empty rect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IRect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl IRect {
    pub fn is_empty(&self) -> bool {
        self.x1 < self.x0 || self.y1 < self.y0
    }

    pub fn intersect(&self, other: IRect) -> IRect {
        IRect {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_map_flips_y() {
        let (x, y) = ndc_to_viewport(0.0, 0.0, 64.0, 64.0);
        assert_eq!((x, y), (32.0, 32.0));
        let (_, top) = ndc_to_viewport(0.0, 1.0, 64.0, 64.0);
        assert_eq!(top, 0.0);
        let (_, bottom) = ndc_to_viewport(0.0, -1.0, 64.0, 64.0);
        assert_eq!(bottom, 64.0);
    }

    #[test]
    fn rect_intersection() {
        let a = IRect { x0: 0, y0: 0, x1: 10, y1: 10 };
        let b = IRect { x0: 5, y0: 5, x1: 20, y1: 20 };
        assert_eq!(a.intersect(b), IRect { x0: 5, y0: 5, x1: 10, y1: 10 });
        let c = IRect { x0: 11, y0: 0, x1: 12, y1: 10 };
        assert!(a.intersect(c).is_empty());
    }
}
