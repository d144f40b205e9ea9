//! Dense rasters positioned inside a global pixel frame.
//!
//! Every stage of the chain works on tiles: a [`Raster`] knows the
//! [`Region`] of the frame it covers, so tiles cut from a large image keep
//! global coordinates and can be pasted back without bookkeeping.

use crate::{Error, Result};
use image::{GrayImage, Luma};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle of pixels, `[x, x + width) x [y, y + height)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Region anchored at the frame origin.
    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Region spanning `[x0, x1) x [y0, y1)`; inverted bounds give an empty region.
    pub fn from_bounds(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self::new(
            x0,
            y0,
            (x1 - x0).max(0) as u32,
            (y1 - y0).max(0) as u32,
        )
    }

    /// Exclusive right edge.
    pub fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && y >= self.y && x < self.right() && y < self.bottom()
    }

    pub fn contains_region(&self, other: &Region) -> bool {
        other.is_empty()
            || (other.x >= self.x
                && other.y >= self.y
                && other.right() <= self.right()
                && other.bottom() <= self.bottom())
    }

    pub fn dilate(&self, rx: u32, ry: u32) -> Region {
        Region::new(
            self.x - rx as i32,
            self.y - ry as i32,
            self.width + 2 * rx,
            self.height + 2 * ry,
        )
    }

    pub fn shift(&self, dx: i32, dy: i32) -> Region {
        Region::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    pub fn intersect(&self, other: &Region) -> Option<Region> {
        let r = Region::from_bounds(
            self.x.max(other.x),
            self.y.max(other.y),
            self.right().min(other.right()),
            self.bottom().min(other.bottom()),
        );
        if r.is_empty() {
            None
        } else {
            Some(r)
        }
    }

    /// Smallest region holding both; empty operands are ignored.
    pub fn union(&self, other: &Region) -> Region {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Region::from_bounds(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    /// Disjoint row-major cover of the region by tiles of at most `tile_width x tile_height`.
    pub fn tiles(&self, tile_width: u32, tile_height: u32) -> Vec<Region> {
        let tw = tile_width.max(1) as i32;
        let th = tile_height.max(1) as i32;
        let mut out = Vec::new();
        let mut y = self.y;
        while y < self.bottom() {
            let mut x = self.x;
            while x < self.right() {
                out.push(Region::from_bounds(
                    x,
                    y,
                    (x + tw).min(self.right()),
                    (y + th).min(self.bottom()),
                ));
                x += tw;
            }
            y += th;
        }
        out
    }
}

/// Row-major raster covering `region` of a global frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster<T> {
    region: Region,
    data: Vec<T>,
}

/// Per-pixel validity flags.
pub type Mask = Raster<bool>;

impl<T: Copy> Raster<T> {
    pub fn filled(region: Region, value: T) -> Self {
        Self {
            region,
            data: vec![value; region.area()],
        }
    }

    pub fn from_vec(region: Region, data: Vec<T>) -> Result<Self> {
        if data.len() != region.area() {
            return Err(Error::DimensionMismatch(format!(
                "raster buffer holds {} samples, region {:?} needs {}",
                data.len(),
                region,
                region.area()
            )));
        }
        Ok(Self { region, data })
    }

    pub fn from_fn(region: Region, f: impl Fn(i32, i32) -> T) -> Self {
        let mut data = Vec::with_capacity(region.area());
        for y in region.y..region.bottom() {
            for x in region.x..region.right() {
                data.push(f(x, y));
            }
        }
        Self { region, data }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn width(&self) -> u32 {
        self.region.width
    }

    pub fn height(&self) -> u32 {
        self.region.height
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    #[inline]
    pub fn offset(&self, x: i32, y: i32) -> Option<usize> {
        if self.region.contains(x, y) {
            let lx = (x - self.region.x) as usize;
            let ly = (y - self.region.y) as usize;
            Some(ly * self.region.width as usize + lx)
        } else {
            None
        }
    }

    #[inline]
    pub fn get(&self, x: i32, y: i32) -> Option<T> {
        self.offset(x, y).map(|i| self.data[i])
    }

    #[inline]
    pub fn get_or(&self, x: i32, y: i32, default: T) -> T {
        self.get(x, y).unwrap_or(default)
    }

    /// Writes a sample; returns false when `(x, y)` lies outside the raster.
    pub fn set(&mut self, x: i32, y: i32, value: T) -> bool {
        match self.offset(x, y) {
            Some(i) => {
                self.data[i] = value;
                true
            }
            None => false,
        }
    }

    /// Row `y` in global coordinates.
    pub fn row(&self, y: i32) -> Option<&[T]> {
        if y < self.region.y || y >= self.region.bottom() {
            return None;
        }
        let w = self.region.width as usize;
        let start = (y - self.region.y) as usize * w;
        Some(&self.data[start..start + w])
    }

    /// Copy of the samples inside `region`, which must lie within this raster.
    pub fn crop(&self, region: Region) -> Result<Raster<T>> {
        if !self.region.contains_region(&region) {
            return Err(Error::DimensionMismatch(format!(
                "cannot crop {:?} out of {:?}",
                region, self.region
            )));
        }
        let mut data = Vec::with_capacity(region.area());
        for y in region.y..region.bottom() {
            if let Some(row) = self.row(y) {
                let start = (region.x - self.region.x) as usize;
                data.extend_from_slice(&row[start..start + region.width as usize]);
            }
        }
        Ok(Raster { region, data })
    }

    /// Copies the overlapping part of `tile` into this raster.
    pub fn paste(&mut self, tile: &Raster<T>) {
        let Some(common) = self.region.intersect(&tile.region) else {
            return;
        };
        let w = common.width as usize;
        for y in common.y..common.bottom() {
            let (Some(src), Some(dst)) = (tile.offset(common.x, y), self.offset(common.x, y))
            else {
                continue;
            };
            self.data[dst..dst + w].copy_from_slice(&tile.data[src..src + w]);
        }
    }

    pub fn map<U: Copy>(&self, f: impl Fn(T) -> U) -> Raster<U> {
        Raster {
            region: self.region,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// `(x, y, value)` in global coordinates, row-major.
    pub fn iter_indexed(&self) -> impl Iterator<Item = (i32, i32, T)> + '_ {
        let w = self.region.width.max(1) as usize;
        self.data.iter().enumerate().map(move |(i, &v)| {
            (
                self.region.x + (i % w) as i32,
                self.region.y + (i / w) as i32,
                v,
            )
        })
    }
}

impl<T: Copy + Send> Raster<T> {
    /// Mutable rows for parallel fills, tagged with their global `y`.
    pub fn par_rows_mut(&mut self) -> impl IndexedParallelIterator<Item = (i32, &mut [T])> + '_ {
        let y0 = self.region.y;
        let w = self.region.width.max(1) as usize;
        self.data
            .par_chunks_mut(w)
            .enumerate()
            .map(move |(i, row)| (y0 + i as i32, row))
    }
}

impl Raster<f32> {
    pub fn from_gray_image(img: &GrayImage) -> Self {
        Self {
            region: Region::from_size(img.width(), img.height()),
            data: img.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    /// Finite min/max over the samples selected by `mask`.
    pub fn min_max(&self, mask: Option<&Mask>) -> Option<(f32, f32)> {
        let mut range: Option<(f32, f32)> = None;
        for (x, y, v) in self.iter_indexed() {
            if !v.is_finite() || mask.is_some_and(|m| !m.get_or(x, y, false)) {
                continue;
            }
            range = Some(match range {
                Some((lo, hi)) => (lo.min(v), hi.max(v)),
                None => (v, v),
            });
        }
        range
    }

    /// Linear rescale to 0..=255 for visual inspection; masked-out samples are black.
    pub fn to_printable_image(&self, mask: Option<&Mask>) -> GrayImage {
        let mut img = GrayImage::new(self.width(), self.height());
        let Some((min_val, max_val)) = self.min_max(mask) else {
            return img;
        };
        let range = max_val - min_val;

        for (x, y, v) in self.iter_indexed() {
            let keep = v.is_finite() && mask.map_or(true, |m| m.get_or(x, y, false));
            let normalized = if keep && range > 0.0 {
                ((v - min_val) / range * 255.0).round() as u8
            } else if keep {
                255
            } else {
                0
            };
            img.put_pixel(
                (x - self.region.x) as u32,
                (y - self.region.y) as u32,
                Luma([normalized]),
            );
        }

        img
    }
}

impl Mask {
    pub fn count_true(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }
}
