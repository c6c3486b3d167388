//! Route planning over the domain graph.
//!
//! The planner keeps a domain-level view of the topology: one node per
//! domain, one edge per gateway (cross-domain) or converter (self-edge).
//! Planning is a depth-bounded search where format convertibility prunes
//! expansion - an edge whose matrix cannot map any currently producible
//! format is never expanded. Surviving paths are ranked deterministically.

use std::collections::HashMap;

use crate::error::RoutingError;
use crate::format::{ConnectionFormat, ConvertibilityMatrix};
use crate::ids::{ConverterId, DomainId, EntityKind, GatewayId, SinkId, SourceId};
use crate::routing::graph::{EdgeIx, Graph, NodeIx};
use crate::topology::{AvailabilityStatus, Converter, Gateway, TopologyStore};

/// One hop of a planned route: a source-to-sink link inside one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingElement {
    /// Producing endpoint of this hop.
    pub source: SourceId,
    /// Consuming endpoint of this hop.
    pub sink: SinkId,
    /// Domain the hop runs in.
    pub domain: DomainId,
    /// Format the hop is carried in.
    pub format: ConnectionFormat,
}

/// A candidate plan from a source to a sink.
///
/// Routes are produced fresh per planning request and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// The requested source.
    pub source: SourceId,
    /// The requested sink.
    pub sink: SinkId,
    /// Hops, ordered source to sink.
    pub elements: Vec<RoutingElement>,
    /// The transitions crossed between consecutive hops
    /// (`elements.len() - 1` entries); used to exclude a failed edge when
    /// re-planning.
    pub edges: Vec<EdgeKey>,
    /// Cumulative edge weight of the underlying path.
    pub weight: u32,
}

impl Route {
    /// Number of hops (routing elements).
    #[must_use]
    pub fn hops(&self) -> usize {
        self.elements.len()
    }
}

/// Identifies the transition a route hop crossed, for re-planning around a
/// failed edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKey {
    /// A cross-domain gateway.
    Gateway(GatewayId),
    /// An intra-domain converter.
    Converter(ConverterId),
}

/// Edge payload of the domain graph.
#[derive(Debug, Clone)]
pub struct TransitionEdge {
    /// Which gateway/converter this edge mirrors.
    pub key: EdgeKey,
    /// The sink feeding the transition.
    pub ingress_sink: SinkId,
    /// The source the transition re-emits on.
    pub egress_source: SourceId,
    /// Allowed format pairs.
    pub matrix: ConvertibilityMatrix,
    /// Domain-assigned cost.
    pub weight: u16,
}

/// Plans routes over an incrementally maintained domain graph.
pub struct RoutePlanner {
    graph: Graph<DomainId, TransitionEdge>,
    domain_nodes: HashMap<DomainId, NodeIx>,
    gateway_edges: HashMap<GatewayId, EdgeIx>,
    converter_edges: HashMap<ConverterId, EdgeIx>,
    max_path_hops: usize,
}

impl RoutePlanner {
    /// Creates an empty planner with the given search depth bound.
    #[must_use]
    pub fn new(max_path_hops: usize) -> Self {
        Self {
            graph: Graph::new(),
            domain_nodes: HashMap::new(),
            gateway_edges: HashMap::new(),
            converter_edges: HashMap::new(),
            max_path_hops,
        }
    }

    // -----------------------------------------------------------------------
    // Incremental maintenance
    // -----------------------------------------------------------------------

    /// Adds a domain node (idempotent).
    pub fn add_domain(&mut self, id: DomainId) {
        if !self.domain_nodes.contains_key(&id) {
            let node = self.graph.add_node(id);
            self.domain_nodes.insert(id, node);
        }
    }

    /// Removes a domain node and every transition touching it.
    pub fn remove_domain(&mut self, id: DomainId) {
        if let Some(node) = self.domain_nodes.remove(&id) {
            self.graph.remove_node(node);
            self.prune_stale_edges();
        }
    }

    /// Adds (or replaces) the edge for a gateway.
    pub fn add_gateway(&mut self, gateway: &Gateway) {
        self.remove_gateway(gateway.id);
        self.add_domain(gateway.ingress_domain);
        self.add_domain(gateway.egress_domain);
        let from = self.domain_nodes[&gateway.ingress_domain];
        let to = self.domain_nodes[&gateway.egress_domain];
        if let Some(edge) = self.graph.add_edge(
            from,
            to,
            TransitionEdge {
                key: EdgeKey::Gateway(gateway.id),
                ingress_sink: gateway.ingress_sink,
                egress_source: gateway.egress_source,
                matrix: gateway.matrix.clone(),
                weight: gateway.weight,
            },
        ) {
            self.gateway_edges.insert(gateway.id, edge);
        }
    }

    /// Removes the edge for a gateway.
    pub fn remove_gateway(&mut self, id: GatewayId) {
        if let Some(edge) = self.gateway_edges.remove(&id) {
            self.graph.remove_edge(edge);
        }
    }

    /// Adds (or replaces) the self-edge for a converter.
    pub fn add_converter(&mut self, converter: &Converter) {
        self.remove_converter(converter.id);
        self.add_domain(converter.domain);
        let node = self.domain_nodes[&converter.domain];
        if let Some(edge) = self.graph.add_edge(
            node,
            node,
            TransitionEdge {
                key: EdgeKey::Converter(converter.id),
                ingress_sink: converter.ingress_sink,
                egress_source: converter.egress_source,
                matrix: converter.matrix.clone(),
                weight: converter.weight,
            },
        ) {
            self.converter_edges.insert(converter.id, edge);
        }
    }

    /// Removes the self-edge for a converter.
    pub fn remove_converter(&mut self, id: ConverterId) {
        if let Some(edge) = self.converter_edges.remove(&id) {
            self.graph.remove_edge(edge);
        }
    }

    /// Drops side-table entries whose edges vanished with a removed node.
    fn prune_stale_edges(&mut self) {
        let graph = &self.graph;
        self.gateway_edges.retain(|id, edge| {
            graph
                .edge(*edge)
                .is_some_and(|e| e.key == EdgeKey::Gateway(*id))
        });
        self.converter_edges.retain(|id, edge| {
            graph
                .edge(*edge)
                .is_some_and(|e| e.key == EdgeKey::Converter(*id))
        });
    }

    /// Rebuilds the whole graph from the store.
    ///
    /// Incremental patching is an optimization only; this always converges
    /// to the same graph and is used after a restore.
    pub fn rebuild(&mut self, store: &TopologyStore) {
        self.graph = Graph::new();
        self.domain_nodes.clear();
        self.gateway_edges.clear();
        self.converter_edges.clear();
        for domain in store.domains() {
            self.add_domain(domain.id);
        }
        for gateway in store.gateways() {
            self.add_gateway(gateway);
        }
        for converter in store.converters() {
            self.add_converter(converter);
        }
    }

    /// A normalized description of the graph, for equivalence checks.
    #[must_use]
    pub fn edge_summary(&self) -> Vec<(EdgeKey, DomainId, DomainId)> {
        let mut summary: Vec<(EdgeKey, DomainId, DomainId)> = self
            .gateway_edges
            .values()
            .chain(self.converter_edges.values())
            .filter_map(|edge| {
                let payload = self.graph.edge(*edge)?;
                let (from, to) = self.graph.endpoints(*edge)?;
                Some((payload.key, *self.graph.node(from)?, *self.graph.node(to)?))
            })
            .collect();
        summary.sort_by_key(|(key, from, to)| {
            let ord = match key {
                EdgeKey::Gateway(id) => (0u8, id.raw()),
                EdgeKey::Converter(id) => (1u8, id.raw()),
            };
            (ord, from.raw(), to.raw())
        });
        summary
    }

    // -----------------------------------------------------------------------
    // Planning
    // -----------------------------------------------------------------------

    /// Plans routes from `source` to `sink`, ranked best-first.
    pub fn plan(
        &self,
        store: &TopologyStore,
        source: SourceId,
        sink: SinkId,
    ) -> Result<Vec<Route>, RoutingError> {
        self.plan_avoiding(store, source, sink, &[])
    }

    /// Plans routes while refusing to traverse the excluded transitions.
    ///
    /// Used for re-planning after a commit failed partway: the failed hop's
    /// edge goes on the exclusion list and planning is retried.
    pub fn plan_avoiding(
        &self,
        store: &TopologyStore,
        source: SourceId,
        sink: SinkId,
        excluded: &[EdgeKey],
    ) -> Result<Vec<Route>, RoutingError> {
        let source_rec = store.source(source).ok_or(RoutingError::InvalidEndpoint {
            kind: EntityKind::Source,
            id: source.raw(),
        })?;
        if source_rec.availability.status == AvailabilityStatus::Unavailable {
            return Err(RoutingError::InvalidEndpoint {
                kind: EntityKind::Source,
                id: source.raw(),
            });
        }
        let sink_rec = store.sink(sink).ok_or(RoutingError::InvalidEndpoint {
            kind: EntityKind::Sink,
            id: sink.raw(),
        })?;
        if sink_rec.availability.status == AvailabilityStatus::Unavailable {
            return Err(RoutingError::InvalidEndpoint {
                kind: EntityKind::Sink,
                id: sink.raw(),
            });
        }

        let no_route = RoutingError::NoRoute { source, sink };
        let (Some(&start), Some(&goal)) = (
            self.domain_nodes.get(&source_rec.domain),
            self.domain_nodes.get(&sink_rec.domain),
        ) else {
            return Err(no_route);
        };

        let source_formats = source_rec.formats.clone();
        let sink_formats = sink_rec.formats.clone();
        let graph = &self.graph;
        let source_domain = source_rec.domain;

        let mut feasible: Vec<Vec<EdgeIx>> = Vec::new();
        graph.find_paths(
            start,
            goal,
            self.max_path_hops,
            |prefix: &[EdgeIx], edge: EdgeIx, target: NodeIx| {
                let Some(payload) = graph.edge(edge) else {
                    return false;
                };
                if excluded.contains(&payload.key) {
                    return false;
                }
                let Some(&target_domain) = graph.node(target) else {
                    return false;
                };
                if !domain_step_allowed(graph, source_domain, prefix, target_domain) {
                    return false;
                }
                let producible = formats_after(graph, &source_formats, prefix);
                !payload.matrix.outputs_for(&producible).is_empty()
            },
            |path: &[EdgeIx]| {
                let producible = formats_after(graph, &source_formats, path);
                if sink_formats.iter().any(|f| producible.contains(f)) {
                    feasible.push(path.to_vec());
                }
            },
        );

        let mut routes: Vec<Route> = feasible
            .into_iter()
            .filter_map(|path| {
                self.assemble_route(source, sink, source_domain, &source_formats, &sink_formats, &path)
            })
            .collect();
        if routes.is_empty() {
            return Err(no_route);
        }

        // Rank: hop count, cumulative weight, then the lowest domain-id
        // sequence for a total deterministic order.
        routes.sort_by(|a, b| {
            a.hops()
                .cmp(&b.hops())
                .then(a.weight.cmp(&b.weight))
                .then_with(|| {
                    let domains_a: Vec<u16> = a.elements.iter().map(|e| e.domain.raw()).collect();
                    let domains_b: Vec<u16> = b.elements.iter().map(|e| e.domain.raw()).collect();
                    domains_a.cmp(&domains_b)
                })
        });
        Ok(routes)
    }

    /// Turns a feasible edge path into a concrete route with per-hop
    /// formats chosen backward from the sink's preference order.
    fn assemble_route(
        &self,
        source: SourceId,
        sink: SinkId,
        source_domain: DomainId,
        source_formats: &[ConnectionFormat],
        sink_formats: &[ConnectionFormat],
        path: &[EdgeIx],
    ) -> Option<Route> {
        let graph = &self.graph;
        let edges: Vec<&TransitionEdge> = path.iter().filter_map(|e| graph.edge(*e)).collect();
        if edges.len() != path.len() {
            return None;
        }

        // Producible format sets per domain position.
        let mut sets: Vec<Vec<ConnectionFormat>> = Vec::with_capacity(edges.len() + 1);
        sets.push(source_formats.to_vec());
        for edge in &edges {
            let next = edge.matrix.outputs_for(sets.last()?);
            sets.push(next);
        }

        // Concrete formats, assigned sink-first.
        let hop_count = edges.len() + 1;
        let mut formats = vec![ConnectionFormat::UNKNOWN; hop_count];
        formats[hop_count - 1] = sink_formats
            .iter()
            .copied()
            .find(|f| sets[hop_count - 1].contains(f))?;
        for j in (0..edges.len()).rev() {
            formats[j] = edges[j]
                .matrix
                .inputs_for(formats[j + 1])
                .into_iter()
                .find(|f| sets[j].contains(f))?;
        }

        // Domain per position.
        let mut domains = Vec::with_capacity(hop_count);
        domains.push(source_domain);
        for edge_ix in path {
            let (_, to) = graph.endpoints(*edge_ix)?;
            domains.push(*graph.node(to)?);
        }

        let mut elements = Vec::with_capacity(hop_count);
        for j in 0..hop_count {
            let hop_source = if j == 0 { source } else { edges[j - 1].egress_source };
            let hop_sink = if j == edges.len() {
                sink
            } else {
                edges[j].ingress_sink
            };
            elements.push(RoutingElement {
                source: hop_source,
                sink: hop_sink,
                domain: domains[j],
                format: formats[j],
            });
        }

        let weight = edges.iter().map(|e| u32::from(e.weight)).sum();
        let edge_keys = edges.iter().map(|e| e.key).collect();
        Some(Route {
            source,
            sink,
            elements,
            edges: edge_keys,
            weight,
        })
    }
}

/// A path may stay in its current domain (converter self-edge) but never
/// re-enter a domain it has left.
fn domain_step_allowed(
    graph: &Graph<DomainId, TransitionEdge>,
    source_domain: DomainId,
    prefix: &[EdgeIx],
    target: DomainId,
) -> bool {
    let mut visited = Vec::with_capacity(prefix.len() + 1);
    visited.push(source_domain);
    for edge in prefix {
        if let Some((_, to)) = graph.endpoints(*edge) {
            if let Some(&domain) = graph.node(to) {
                if domain != *visited.last().unwrap_or(&source_domain) {
                    visited.push(domain);
                }
            }
        }
    }
    let current = *visited.last().unwrap_or(&source_domain);
    if target == current {
        return true;
    }
    !visited.contains(&target)
}

/// The formats producible after traversing `path` starting from the
/// source's format list.
fn formats_after(
    graph: &Graph<DomainId, TransitionEdge>,
    source_formats: &[ConnectionFormat],
    path: &[EdgeIx],
) -> Vec<ConnectionFormat> {
    let mut set = source_formats.to_vec();
    for edge in path {
        let Some(payload) = graph.edge(*edge) else {
            return Vec::new();
        };
        set = payload.matrix.outputs_for(&set);
        if set.is_empty() {
            break;
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{
        Availability, ConverterData, DomainData, GatewayData, SinkData, SourceData,
    };

    fn stereo() -> Vec<ConnectionFormat> {
        vec![ConnectionFormat::STEREO]
    }

    struct Fixture {
        store: TopologyStore,
        planner: RoutePlanner,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: TopologyStore::new(),
                planner: RoutePlanner::new(8),
            }
        }

        fn domain(&mut self, name: &str) -> DomainId {
            let id = self
                .store
                .register_domain(DomainData::new(name, format!("bus.{name}")))
                .unwrap();
            self.planner.add_domain(id);
            id
        }

        fn source(&mut self, domain: DomainId, name: &str, formats: Vec<ConnectionFormat>) -> SourceId {
            self.store
                .register_source(SourceData::new(domain, name, formats))
                .unwrap()
        }

        fn sink(&mut self, domain: DomainId, name: &str, formats: Vec<ConnectionFormat>) -> SinkId {
            self.store
                .register_sink(SinkData::new(domain, name, formats))
                .unwrap()
        }

        fn gateway(
            &mut self,
            name: &str,
            from: DomainId,
            to: DomainId,
            matrix: ConvertibilityMatrix,
            weight: u16,
        ) -> GatewayId {
            let ingress = self.sink(from, &format!("{name}-in"), matrix.source_formats().to_vec());
            let egress = self.source(to, &format!("{name}-out"), matrix.sink_formats().to_vec());
            let mut data = GatewayData::new(name, ingress, egress, from, to, matrix);
            data.weight = weight;
            let id = self.store.register_gateway(data).unwrap();
            self.planner
                .add_gateway(self.store.gateway(id).unwrap());
            id
        }

        fn converter(
            &mut self,
            name: &str,
            domain: DomainId,
            matrix: ConvertibilityMatrix,
        ) -> ConverterId {
            let ingress = self.sink(domain, &format!("{name}-in"), matrix.source_formats().to_vec());
            let egress = self.source(domain, &format!("{name}-out"), matrix.sink_formats().to_vec());
            let data = ConverterData::new(name, ingress, egress, domain, matrix);
            let id = self.store.register_converter(data).unwrap();
            self.planner
                .add_converter(self.store.converter(id).unwrap());
            id
        }
    }

    #[test]
    fn test_two_domain_gateway_route() {
        let mut fx = Fixture::new();
        let dom_a = fx.domain("a");
        let dom_b = fx.domain("b");
        let radio = fx.source(dom_a, "radio", stereo());
        let speakers = fx.sink(dom_b, "speakers", stereo());
        let gw = fx.gateway("ab", dom_a, dom_b, ConvertibilityMatrix::identity(stereo()), 1);

        let routes = fx.planner.plan(&fx.store, radio, speakers).unwrap();
        assert_eq!(routes.len(), 1);
        let route = &routes[0];
        assert_eq!(route.hops(), 2);
        let gateway = fx.store.gateway(gw).unwrap();
        assert_eq!(
            route.elements[0],
            RoutingElement {
                source: radio,
                sink: gateway.ingress_sink,
                domain: dom_a,
                format: ConnectionFormat::STEREO,
            }
        );
        assert_eq!(
            route.elements[1],
            RoutingElement {
                source: gateway.egress_source,
                sink: speakers,
                domain: dom_b,
                format: ConnectionFormat::STEREO,
            }
        );
    }

    #[test]
    fn test_denied_matrix_yields_no_route() {
        let mut fx = Fixture::new();
        let dom_a = fx.domain("a");
        let dom_b = fx.domain("b");
        let radio = fx.source(dom_a, "radio", stereo());
        let speakers = fx.sink(dom_b, "speakers", stereo());
        fx.gateway(
            "ab",
            dom_a,
            dom_b,
            ConvertibilityMatrix::from_fn(stereo(), stereo(), |_, _| false),
            1,
        );

        let err = fx.planner.plan(&fx.store, radio, speakers).unwrap_err();
        assert!(matches!(err, RoutingError::NoRoute { .. }));
    }

    #[test]
    fn test_unknown_endpoint_is_invalid() {
        let mut fx = Fixture::new();
        let dom_a = fx.domain("a");
        let radio = fx.source(dom_a, "radio", stereo());
        let err = fx
            .planner
            .plan(&fx.store, radio, SinkId(999))
            .unwrap_err();
        assert!(matches!(
            err,
            RoutingError::InvalidEndpoint {
                kind: EntityKind::Sink,
                ..
            }
        ));
    }

    #[test]
    fn test_unavailable_endpoint_is_invalid() {
        let mut fx = Fixture::new();
        let dom_a = fx.domain("a");
        let radio = fx.source(dom_a, "radio", stereo());
        let speakers = fx.sink(dom_a, "speakers", stereo());
        fx.store
            .set_sink_availability(speakers, Availability::unavailable(3))
            .unwrap();
        let err = fx.planner.plan(&fx.store, radio, speakers).unwrap_err();
        assert!(matches!(
            err,
            RoutingError::InvalidEndpoint {
                kind: EntityKind::Sink,
                ..
            }
        ));
    }

    #[test]
    fn test_same_domain_direct_route() {
        let mut fx = Fixture::new();
        let dom = fx.domain("a");
        let radio = fx.source(dom, "radio", stereo());
        let speakers = fx.sink(dom, "speakers", stereo());
        let routes = fx.planner.plan(&fx.store, radio, speakers).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].hops(), 1);
        assert_eq!(routes[0].elements[0].format, ConnectionFormat::STEREO);
    }

    #[test]
    fn test_converter_bridges_disjoint_formats() {
        let mut fx = Fixture::new();
        let dom = fx.domain("a");
        let radio = fx.source(dom, "radio", vec![ConnectionFormat::MONO]);
        let speakers = fx.sink(dom, "speakers", stereo());
        fx.converter(
            "upmix",
            dom,
            ConvertibilityMatrix::any(vec![ConnectionFormat::MONO], stereo()),
        );
        let routes = fx.planner.plan(&fx.store, radio, speakers).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].hops(), 2);
        assert_eq!(routes[0].elements[0].format, ConnectionFormat::MONO);
        assert_eq!(routes[0].elements[1].format, ConnectionFormat::STEREO);
    }

    #[test]
    fn test_ranking_prefers_fewer_hops_then_weight() {
        let mut fx = Fixture::new();
        let dom_a = fx.domain("a");
        let dom_b = fx.domain("b");
        let dom_c = fx.domain("c");
        let radio = fx.source(dom_a, "radio", stereo());
        let speakers = fx.sink(dom_c, "speakers", stereo());
        // Direct but heavy.
        fx.gateway("ac", dom_a, dom_c, ConvertibilityMatrix::identity(stereo()), 10);
        // Two light hops through b.
        fx.gateway("ab", dom_a, dom_b, ConvertibilityMatrix::identity(stereo()), 1);
        fx.gateway("bc", dom_b, dom_c, ConvertibilityMatrix::identity(stereo()), 1);

        let routes = fx.planner.plan(&fx.store, radio, speakers).unwrap();
        assert_eq!(routes.len(), 2);
        // Fewer hops wins despite the higher weight.
        assert_eq!(routes[0].hops(), 2);
        assert_eq!(routes[0].weight, 10);
        assert_eq!(routes[1].hops(), 3);
        assert_eq!(routes[1].weight, 2);
    }

    #[test]
    fn test_equal_hop_routes_ranked_by_weight() {
        let mut fx = Fixture::new();
        let dom_a = fx.domain("a");
        let dom_b = fx.domain("b");
        let radio = fx.source(dom_a, "radio", stereo());
        let speakers = fx.sink(dom_b, "speakers", stereo());
        fx.gateway("heavy", dom_a, dom_b, ConvertibilityMatrix::identity(stereo()), 5);
        fx.gateway("light", dom_a, dom_b, ConvertibilityMatrix::identity(stereo()), 2);

        let routes = fx.planner.plan(&fx.store, radio, speakers).unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].weight, 2);
        assert_eq!(routes[1].weight, 5);
    }

    #[test]
    fn test_no_denied_pair_ever_appears() {
        // mono -> stereo allowed, everything else denied; the planner must
        // only emit hops using the allowed pair.
        let mut fx = Fixture::new();
        let dom_a = fx.domain("a");
        let dom_b = fx.domain("b");
        let formats = vec![ConnectionFormat::MONO, ConnectionFormat::STEREO];
        let radio = fx.source(dom_a, "radio", formats.clone());
        let speakers = fx.sink(dom_b, "speakers", formats.clone());
        let matrix = ConvertibilityMatrix::from_fn(formats.clone(), formats, |src, snk| {
            src == ConnectionFormat::MONO && snk == ConnectionFormat::STEREO
        });
        fx.gateway("ab", dom_a, dom_b, matrix.clone(), 1);

        let routes = fx.planner.plan(&fx.store, radio, speakers).unwrap();
        for route in &routes {
            for pair in route.elements.windows(2) {
                assert!(matrix.allows(pair[0].format, pair[1].format));
            }
        }
        assert_eq!(routes[0].elements[0].format, ConnectionFormat::MONO);
        assert_eq!(routes[0].elements[1].format, ConnectionFormat::STEREO);
    }

    #[test]
    fn test_plan_avoiding_excludes_failed_edge() {
        let mut fx = Fixture::new();
        let dom_a = fx.domain("a");
        let dom_b = fx.domain("b");
        let radio = fx.source(dom_a, "radio", stereo());
        let speakers = fx.sink(dom_b, "speakers", stereo());
        let primary = fx.gateway("primary", dom_a, dom_b, ConvertibilityMatrix::identity(stereo()), 1);
        fx.gateway("backup", dom_a, dom_b, ConvertibilityMatrix::identity(stereo()), 9);

        let routes = fx
            .planner
            .plan_avoiding(&fx.store, radio, speakers, &[EdgeKey::Gateway(primary)])
            .unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].weight, 9);

        // Excluding both leaves nothing.
        let all: Vec<EdgeKey> = fx
            .store
            .gateways()
            .map(|g| EdgeKey::Gateway(g.id))
            .collect();
        assert!(matches!(
            fx.planner
                .plan_avoiding(&fx.store, radio, speakers, &all)
                .unwrap_err(),
            RoutingError::NoRoute { .. }
        ));
    }

    #[test]
    fn test_path_never_reenters_a_domain() {
        let mut fx = Fixture::new();
        let dom_a = fx.domain("a");
        let dom_b = fx.domain("b");
        let radio = fx.source(dom_a, "radio", stereo());
        let speakers = fx.sink(dom_b, "speakers", stereo());
        fx.gateway("ab", dom_a, dom_b, ConvertibilityMatrix::identity(stereo()), 1);
        fx.gateway("ba", dom_b, dom_a, ConvertibilityMatrix::identity(stereo()), 1);

        let routes = fx.planner.plan(&fx.store, radio, speakers).unwrap();
        // Only the direct a->b route; a->b->a->... is forbidden.
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].hops(), 2);
    }

    #[test]
    fn test_depth_bound_limits_search() {
        let mut fx = Fixture::new();
        fx.planner = RoutePlanner::new(1);
        let dom_a = fx.domain("a");
        let dom_b = fx.domain("b");
        let dom_c = fx.domain("c");
        let radio = fx.source(dom_a, "radio", stereo());
        let speakers = fx.sink(dom_c, "speakers", stereo());
        fx.gateway("ab", dom_a, dom_b, ConvertibilityMatrix::identity(stereo()), 1);
        fx.gateway("bc", dom_b, dom_c, ConvertibilityMatrix::identity(stereo()), 1);
        // Two edges needed but only one allowed.
        assert!(matches!(
            fx.planner.plan(&fx.store, radio, speakers).unwrap_err(),
            RoutingError::NoRoute { .. }
        ));
    }

    #[test]
    fn test_incremental_matches_rebuild() {
        let mut fx = Fixture::new();
        let dom_a = fx.domain("a");
        let dom_b = fx.domain("b");
        let dom_c = fx.domain("c");
        fx.source(dom_a, "radio", stereo());
        fx.sink(dom_c, "speakers", stereo());
        fx.gateway("ab", dom_a, dom_b, ConvertibilityMatrix::identity(stereo()), 1);
        let bc = fx.gateway("bc", dom_b, dom_c, ConvertibilityMatrix::identity(stereo()), 1);
        fx.converter("conv", dom_b, ConvertibilityMatrix::identity(stereo()));

        // Mutate incrementally: drop one gateway.
        fx.store.deregister_gateway(bc).unwrap();
        fx.planner.remove_gateway(bc);

        let mut rebuilt = RoutePlanner::new(8);
        rebuilt.rebuild(&fx.store);
        assert_eq!(fx.planner.edge_summary(), rebuilt.edge_summary());
    }

    #[test]
    fn test_remove_domain_drops_its_transitions() {
        let mut fx = Fixture::new();
        let dom_a = fx.domain("a");
        let dom_b = fx.domain("b");
        fx.source(dom_a, "radio", stereo());
        fx.gateway("ab", dom_a, dom_b, ConvertibilityMatrix::identity(stereo()), 1);
        fx.planner.remove_domain(dom_b);
        assert!(fx.planner.edge_summary().is_empty());
    }
}
