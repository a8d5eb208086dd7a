//! Chunked block storage with lazy, seed-deterministic terrain generation.

use std::collections::BTreeMap;

use contracts::{CHUNK_SIZE_X, CHUNK_SIZE_Z};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::catalogs::{Catalogs, AIR};
use crate::hash2;
use crate::spatial::Vec3i;

const CHUNK_CELLS: usize = (CHUNK_SIZE_X * CHUNK_SIZE_Z) as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub cx: i32,
    pub cz: i32,
}

impl ChunkKey {
    pub fn containing(pos: Vec3i) -> Self {
        Self {
            cx: pos.x.div_euclid(CHUNK_SIZE_X),
            cz: pos.z.div_euclid(CHUNK_SIZE_Z),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub blocks: Vec<u16>,
}

impl Chunk {
    fn index(lx: i32, lz: i32) -> usize {
        (lz * CHUNK_SIZE_X + lx) as usize
    }

    pub fn get(&self, lx: i32, lz: i32) -> u16 {
        self.blocks.get(Self::index(lx, lz)).copied().unwrap_or(AIR)
    }

    fn set(&mut self, lx: i32, lz: i32, block: u16) {
        if let Some(cell) = self.blocks.get_mut(Self::index(lx, lz)) {
            *cell = block;
        }
    }

    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for block in &self.blocks {
            hasher.update(block.to_le_bytes());
        }
        hasher.finalize().into()
    }
}

/// Terrain parameters. Captured in snapshots so a reload regenerates identical
/// untouched chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldGenParams {
    pub seed: i64,
    pub boundary_r: i32,
    pub biome_region_size: i32,
    pub spawn_clear_radius: i32,
    pub ore_cluster_scale_permille: u32,
    pub terrain_cluster_scale_permille: u32,
    pub sprinkle_stone_permille: u32,
    pub sprinkle_dirt_permille: u32,
    pub sprinkle_log_permille: u32,
}

impl Default for WorldGenParams {
    fn default() -> Self {
        Self {
            seed: 0,
            boundary_r: 4000,
            biome_region_size: 64,
            spawn_clear_radius: 6,
            ore_cluster_scale_permille: 1000,
            terrain_cluster_scale_permille: 1000,
            sprinkle_stone_permille: 8,
            sprinkle_dirt_permille: 6,
            sprinkle_log_permille: 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GenPalette {
    dirt: u16,
    sand: u16,
    gravel: u16,
    stone: u16,
    log: u16,
    coal: u16,
    iron: u16,
    copper: u16,
    crystal: u16,
}

impl GenPalette {
    fn resolve(catalogs: &Catalogs) -> Self {
        let id = |name: &str| catalogs.block_id(name).unwrap_or(AIR);
        Self {
            dirt: id("DIRT"),
            sand: id("SAND"),
            gravel: id("GRAVEL"),
            stone: id("STONE"),
            log: id("LOG"),
            coal: id("COAL_ORE"),
            iron: id("IRON_ORE"),
            copper: id("COPPER_ORE"),
            crystal: id("CRYSTAL_ORE"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkStore {
    pub gen: WorldGenParams,
    palette: GenPalette,
    chunks: BTreeMap<ChunkKey, Chunk>,
}

impl ChunkStore {
    pub fn new(gen: WorldGenParams, catalogs: &Catalogs) -> Self {
        Self {
            gen,
            palette: GenPalette::resolve(catalogs),
            chunks: BTreeMap::new(),
        }
    }

    pub fn in_bounds(&self, pos: Vec3i) -> bool {
        if pos.y != 0 {
            return false;
        }
        let r = self.gen.boundary_r;
        r <= 0 || (pos.x >= -r && pos.x <= r && pos.z >= -r && pos.z <= r)
    }

    /// Block at `pos`. Unloaded chunks answer from the generator without being
    /// materialized.
    pub fn get(&self, pos: Vec3i) -> u16 {
        if !self.in_bounds(pos) {
            return AIR;
        }
        let key = ChunkKey::containing(pos);
        let lx = pos.x.rem_euclid(CHUNK_SIZE_X);
        let lz = pos.z.rem_euclid(CHUNK_SIZE_Z);
        match self.chunks.get(&key) {
            Some(chunk) => chunk.get(lx, lz),
            None => self.generate_cell(pos.x, pos.z),
        }
    }

    pub fn set(&mut self, pos: Vec3i, block: u16) {
        if !self.in_bounds(pos) {
            return;
        }
        let key = ChunkKey::containing(pos);
        let lx = pos.x.rem_euclid(CHUNK_SIZE_X);
        let lz = pos.z.rem_euclid(CHUNK_SIZE_Z);
        self.ensure(key).set(lx, lz, block);
    }

    /// Materializes a chunk; returns true when it was newly generated.
    pub fn load(&mut self, key: ChunkKey) -> bool {
        if self.chunks.contains_key(&key) {
            return false;
        }
        self.ensure(key);
        true
    }

    fn ensure(&mut self, key: ChunkKey) -> &mut Chunk {
        if !self.chunks.contains_key(&key) {
            let chunk = self.generate_chunk(key);
            self.chunks.insert(key, chunk);
        }
        self.chunks.entry(key).or_insert_with(|| Chunk {
            blocks: vec![AIR; CHUNK_CELLS],
        })
    }

    /// Loads every chunk touched by the square of `radius` around `center`.
    /// Returns the keys that were generated by this call, in key order.
    pub fn load_around(&mut self, center: Vec3i, radius: i32) -> Vec<ChunkKey> {
        let lo = ChunkKey::containing(center.offset(-radius, -radius));
        let hi = ChunkKey::containing(center.offset(radius, radius));
        let mut fresh = Vec::new();
        for cx in lo.cx..=hi.cx {
            for cz in lo.cz..=hi.cz {
                let key = ChunkKey { cx, cz };
                if self.load(key) {
                    fresh.push(key);
                }
            }
        }
        fresh
    }

    pub fn loaded_keys(&self) -> Vec<ChunkKey> {
        self.chunks.keys().copied().collect()
    }

    pub fn loaded_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk(&self, key: ChunkKey) -> Option<&Chunk> {
        self.chunks.get(&key)
    }

    pub fn chunks(&self) -> impl Iterator<Item = (&ChunkKey, &Chunk)> {
        self.chunks.iter()
    }

    /// Replaces a chunk wholesale; used by snapshot import.
    pub fn insert_chunk(&mut self, key: ChunkKey, blocks: Vec<u16>) {
        let mut blocks = blocks;
        blocks.resize(CHUNK_CELLS, AIR);
        self.chunks.insert(key, Chunk { blocks });
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Full generated surface of a chunk regardless of load state.
    pub fn chunk_blocks(&self, key: ChunkKey) -> Vec<u16> {
        match self.chunks.get(&key) {
            Some(chunk) => chunk.blocks.clone(),
            None => self.generate_chunk(key).blocks,
        }
    }

    pub fn biome_at(&self, x: i32, z: i32) -> &'static str {
        biome_at(self.gen.seed, x, z, self.gen.biome_region_size)
    }

    /// Nearest air cell to `around` within `radius`, scanning rings outwards.
    pub fn find_spawn_air(&self, around: Vec3i, radius: i32, solid: impl Fn(u16) -> bool) -> Vec3i {
        let origin = Vec3i::new(around.x, 0, around.z);
        if self.in_bounds(origin) && !solid(self.get(origin)) {
            return origin;
        }
        for r in 1..=radius {
            for dx in -r..=r {
                for dz in -r..=r {
                    if dx.abs() != r && dz.abs() != r {
                        continue;
                    }
                    let pos = origin.offset(dx, dz);
                    if self.in_bounds(pos) && !solid(self.get(pos)) {
                        return pos;
                    }
                }
            }
        }
        origin
    }

    fn generate_chunk(&self, key: ChunkKey) -> Chunk {
        let mut blocks = vec![AIR; CHUNK_CELLS];
        for lz in 0..CHUNK_SIZE_Z {
            for lx in 0..CHUNK_SIZE_X {
                let wx = key.cx * CHUNK_SIZE_X + lx;
                let wz = key.cz * CHUNK_SIZE_Z + lz;
                let cell = if self.in_bounds(Vec3i::new(wx, 0, wz)) {
                    self.generate_cell(wx, wz)
                } else {
                    AIR
                };
                blocks[Chunk::index(lx, lz)] = cell;
            }
        }
        Chunk { blocks }
    }

    /// Precedence: rare ores, common ores, biome terrain, then sparse sprinkles.
    fn generate_cell(&self, x: i32, z: i32) -> u16 {
        let g = &self.gen;
        let p = &self.palette;
        if within_spawn_clear(x, z, g.spawn_clear_radius) {
            return AIR;
        }
        let seed = g.seed;
        let ore = |base| scale_permille(base, g.ore_cluster_scale_permille);
        let terrain = |base| scale_permille(base, g.terrain_cluster_scale_permille);

        if in_cluster(seed.wrapping_add(101), x, z, 192, 2, ore(200)) {
            return p.crystal;
        }
        if in_cluster(seed.wrapping_add(102), x, z, 128, 3, ore(450)) {
            return p.iron;
        }
        if in_cluster(seed.wrapping_add(103), x, z, 128, 3, ore(450)) {
            return p.copper;
        }
        if in_cluster(seed.wrapping_add(104), x, z, 64, 4, ore(650)) {
            return p.coal;
        }

        let biome = biome_at(seed, x, z, g.biome_region_size);
        let block = match biome {
            "FOREST" => {
                if in_cluster(seed.wrapping_add(201), x, z, 48, 4, terrain(450)) {
                    p.log
                } else if in_cluster(seed.wrapping_add(202), x, z, 32, 4, terrain(500)) {
                    p.stone
                } else if in_cluster(seed.wrapping_add(203), x, z, 48, 3, terrain(350)) {
                    p.dirt
                } else if in_cluster(seed.wrapping_add(204), x, z, 96, 2, terrain(180)) {
                    p.gravel
                } else {
                    AIR
                }
            }
            "DESERT" => {
                if in_cluster(seed.wrapping_add(301), x, z, 48, 3, terrain(550)) {
                    p.sand
                } else if in_cluster(seed.wrapping_add(302), x, z, 32, 4, terrain(450)) {
                    p.stone
                } else if in_cluster(seed.wrapping_add(303), x, z, 96, 2, terrain(200)) {
                    p.gravel
                } else {
                    AIR
                }
            }
            _ => {
                if in_cluster(seed.wrapping_add(401), x, z, 48, 3, terrain(400)) {
                    p.dirt
                } else if in_cluster(seed.wrapping_add(402), x, z, 32, 4, terrain(500)) {
                    p.stone
                } else if in_cluster(seed.wrapping_add(403), x, z, 96, 2, terrain(180)) {
                    p.gravel
                } else {
                    AIR
                }
            }
        };
        if block != AIR {
            return block;
        }

        let stone = u64::from(g.sprinkle_stone_permille.min(1000));
        let dirt = u64::from(g.sprinkle_dirt_permille.min(1000));
        let log = u64::from(g.sprinkle_log_permille.min(1000));
        let roll = hash2(seed.wrapping_add(999), x, z) % 1000;
        if roll < stone {
            p.stone
        } else if roll < stone + dirt {
            if biome == "DESERT" {
                p.sand
            } else {
                p.dirt
            }
        } else if roll < stone + dirt + log && biome == "FOREST" {
            p.log
        } else {
            AIR
        }
    }
}

pub fn biome_at(seed: i64, x: i32, z: i32, region_size: i32) -> &'static str {
    let region = region_size.max(1);
    match hash2(seed, x.div_euclid(region), z.div_euclid(region)) % 3 {
        0 => "PLAINS",
        1 => "FOREST",
        _ => "DESERT",
    }
}

fn within_spawn_clear(x: i32, z: i32, radius: i32) -> bool {
    if radius <= 0 {
        return false;
    }
    let (dx, dz, r) = (i64::from(x), i64::from(z), i64::from(radius));
    dx * dx + dz * dz <= r * r
}

fn scale_permille(base: u64, scale: u32) -> u64 {
    let scale = if scale == 0 { 1000 } else { u64::from(scale) };
    ((base * scale + 500) / 1000).min(1000)
}

/// True when (x, z) lies within `radius` of a seeded cluster centre in this or a
/// neighbouring grid cell.
fn in_cluster(seed: i64, x: i32, z: i32, grid: i32, radius: i32, prob_permille: u64) -> bool {
    if grid <= 0 || radius <= 0 || prob_permille == 0 {
        return false;
    }
    let gx = x.div_euclid(grid);
    let gz = z.div_euclid(grid);
    let r2 = i64::from(radius) * i64::from(radius);
    for dz in -1..=1 {
        for dx in -1..=1 {
            let cgx = gx + dx;
            let cgz = gz + dz;
            let h = hash2(seed, cgx, cgz);
            if h % 1000 >= prob_permille {
                continue;
            }
            let ox = ((h >> 10) % grid as u64) as i32;
            let oz = ((h >> 20) % grid as u64) as i32;
            let ddx = i64::from(x - (cgx * grid + ox));
            let ddz = i64::from(z - (cgz * grid + oz));
            if ddx * ddx + ddz * ddz <= r2 {
                return true;
            }
        }
    }
    false
}
